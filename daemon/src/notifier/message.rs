use super::MailerRequest;

/// Builds the RFC 5322 message for `request`: fixed headers, a blank line
/// and the HTML body, all CRLF terminated.
pub fn compose(from: &str, request: &MailerRequest) -> String {
    let to = request
        .recipients
        .iter()
        .map(|r| r.email.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/html; charset=UTF-8\r\n\
         \r\n\
         {body}\r\n",
        subject = request.subject,
        body = request.body_html,
    )
}

/// DATA payload: bare LFs become CRLF, lines starting with `.` are
/// dot-stuffed and the terminating `.` line is appended.
pub(crate) fn encode_data(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let body = message.strip_suffix('\n').unwrap_or(message);
    if !body.is_empty() {
        for line in body.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with('.') {
                out.push(b'.');
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}
