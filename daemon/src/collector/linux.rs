use super::{CollectorError, ProcessCollector, ProcessSample};
use std::collections::HashMap;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Clone)]
struct CpuSample {
    total_ticks: u64, // utime + stime
    start_ticks: u64,
    timestamp: Instant,
}

struct StatFields {
    name: String,
    total_ticks: u64,
    start_ticks: u64,
}

pub struct LinuxProcessCollector {
    page_size: u64,
    clock_ticks: u64,
    mem_total_bytes: u64,
    cpu_samples: Mutex<HashMap<u32, CpuSample>>,
}

impl LinuxProcessCollector {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let clock_ticks = (unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64).max(1);
        let mem_total_bytes = Self::get_mem_total();
        Self {
            page_size,
            clock_ticks,
            mem_total_bytes,
            cpu_samples: Mutex::new(HashMap::new()),
        }
    }

    fn get_mem_total() -> u64 {
        let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
                return kb * 1024;
            }
        }
        0
    }

    fn samples(&self) -> MutexGuard<'_, HashMap<u32, CpuSample>> {
        self.cpu_samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// `comm` is arbitrary bytes, so invalid UTF-8 is replaced rather than
    /// failing the read.
    fn read_proc_file(pid: u32, file: &str) -> Result<String, CollectorError> {
        let bytes = fs::read(format!("/proc/{pid}/{file}"))
            .map_err(|source| CollectorError::Read { pid, source })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_stat(pid: u32) -> Result<StatFields, CollectorError> {
        let content = Self::read_proc_file(pid, "stat")?;
        parse_stat(&content).ok_or(CollectorError::Malformed { pid })
    }

    fn read_rss_bytes(&self, pid: u32) -> Result<u64, CollectorError> {
        let content = Self::read_proc_file(pid, "statm")?;
        let rss_pages: u64 = content
            .split_whitespace()
            .nth(1)
            .and_then(|field| field.parse().ok())
            .ok_or(CollectorError::Malformed { pid })?;
        Ok(rss_pages * self.page_size)
    }
}

impl Default for LinuxProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCollector for LinuxProcessCollector {
    fn enumerate(&self) -> Result<Vec<u32>, CollectorError> {
        let entries = fs::read_dir("/proc").map_err(CollectorError::Enumerate)?;
        let mut pids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(CollectorError::Enumerate)?;
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn prime(&self, pid: u32) -> Result<(), CollectorError> {
        let stat = Self::read_stat(pid)?;
        self.samples().insert(
            pid,
            CpuSample {
                total_ticks: stat.total_ticks,
                start_ticks: stat.start_ticks,
                timestamp: Instant::now(),
            },
        );
        Ok(())
    }

    fn sample(&self, pid: u32) -> Result<ProcessSample, CollectorError> {
        let prev = self
            .samples()
            .remove(&pid)
            .ok_or(CollectorError::NotPrimed { pid })?;
        let stat = Self::read_stat(pid)?;
        if stat.start_ticks != prev.start_ticks {
            return Err(CollectorError::Replaced { pid });
        }
        let rss_bytes = self.read_rss_bytes(pid)?;

        let tick_delta = stat.total_ticks.saturating_sub(prev.total_ticks);
        let time_delta = prev.timestamp.elapsed().as_secs_f64();
        let cpu_percent = cpu_percent(tick_delta, self.clock_ticks, time_delta);

        let memory_percent = if self.mem_total_bytes > 0 {
            rss_bytes as f64 / self.mem_total_bytes as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProcessSample {
            pid,
            name: stat.name,
            cpu_percent,
            memory_percent,
        })
    }

    fn reset(&self) {
        self.samples().clear();
    }
}

/// Percentage of one CPU consumed over `elapsed_secs`.
fn cpu_percent(tick_delta: u64, clock_ticks: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    let cpu_seconds = tick_delta as f64 / clock_ticks as f64;
    cpu_seconds / elapsed_secs * 100.0
}

/// The command name sits in parentheses and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<StatFields> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let name = content[open + 1..close].to_string();
    // fields after the name start at `state` (field 3 in proc(5))
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if rest.len() < 20 {
        return None;
    }
    let utime: u64 = rest[11].parse().ok()?;
    let stime: u64 = rest[12].parse().ok()?;
    let start_ticks: u64 = rest[19].parse().ok()?;
    Some(StatFields {
        name,
        total_ticks: utime + stime,
        start_ticks,
    })
}
