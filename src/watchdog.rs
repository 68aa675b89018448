//! Liveness watchdog
//!
//! The watchdog proves that the trace mapping stays writable and the cursor keeps
//! advancing, independently of the traced program. Every interval it reserves one
//! byte and writes [`HEARTBEAT_SENTINEL`]; after a bounded number of heartbeats it
//! stops on its own. If the traced program hangs, the heartbeats still land, which
//! tells "tool hung" apart from "mapping corrupted".
//!
//! Two modes:
//!
//! - **Thread** (default): a native thread sharing the [`TraceBuffer`]; terminated by
//!   a stop flag plus join.
//! - **Process**: a forked child writing through the inherited `MAP_SHARED` mapping,
//!   where the cursor also lives; terminated with `SIGKILL` and reaped.
//!
//! Termination failures are reported in a [`TerminationReport`], never raised.

use crate::error::{Result, TraceError};
use crate::record::HEARTBEAT_SENTINEL;
use crate::trace_buffer::TraceBuffer;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Where the heartbeat loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogMode {
    #[default]
    Thread,
    Process,
}

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub mode: WatchdogMode,
    /// Heartbeat budget; the watchdog exits after this many
    pub heartbeats: u32,
    /// Sleep between heartbeats in milliseconds
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            enabled: true,
            mode: WatchdogMode::Thread,
            heartbeats: 100,
            interval_ms: 20,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of stopping the watchdog at shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminationReport {
    /// Stopped while still running; heartbeat count is unknown for a child process
    Stopped { heartbeats: Option<u32> },
    /// Had already used up its heartbeat budget
    AlreadyFinished { heartbeats: Option<u32> },
    /// Could not be stopped or reaped
    Failed { reason: String },
}

impl TerminationReport {
    pub fn is_success(&self) -> bool {
        !matches!(self, TerminationReport::Failed { .. })
    }
}

impl fmt::Display for TerminationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let beats = |h: &Option<u32>| h.map_or_else(String::new, |h| format!(" after {h} heartbeats"));
        match self {
            TerminationReport::Stopped { heartbeats } => {
                write!(f, "watchdog terminated{}", beats(heartbeats))
            }
            TerminationReport::AlreadyFinished { heartbeats } => {
                write!(f, "watchdog had already finished{}", beats(heartbeats))
            }
            TerminationReport::Failed { reason } => {
                write!(f, "failed to terminate watchdog: {reason}")
            }
        }
    }
}

/// Write up to `budget` heartbeats, stopping early on `stop` or a refused reservation
fn heartbeat_loop(
    buffer: &TraceBuffer,
    budget: u32,
    interval: Duration,
    stop: Option<&AtomicBool>,
) -> u32 {
    let stopped = || stop.is_some_and(|s| s.load(Ordering::Acquire));
    let mut beats = 0;

    for _ in 0..budget {
        if stopped() {
            break;
        }
        if buffer.append(&[HEARTBEAT_SENTINEL]).is_err() {
            break;
        }
        beats += 1;

        if stop.is_some() {
            let deadline = Instant::now() + interval;
            loop {
                let now = Instant::now();
                if stopped() || now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        } else {
            thread::sleep(interval);
        }
    }
    beats
}

enum Worker {
    Thread {
        stop: Arc<AtomicBool>,
        handle: JoinHandle<u32>,
    },
    Process {
        pid: Pid,
    },
}

/// Handle to a running watchdog
pub struct Watchdog {
    worker: Option<Worker>,
}

impl Watchdog {
    /// Start heartbeating into `buffer`
    pub fn spawn(buffer: Arc<TraceBuffer>, config: &WatchdogConfig) -> Result<Self> {
        let budget = config.heartbeats;
        let interval = config.interval();

        let worker = match config.mode {
            WatchdogMode::Thread => {
                let stop = Arc::new(AtomicBool::new(false));
                let thread_stop = stop.clone();
                let handle = thread::Builder::new()
                    .name("memtrace-watchdog".to_string())
                    .spawn(move || heartbeat_loop(&buffer, budget, interval, Some(&thread_stop)))
                    .map_err(|e| TraceError::Watchdog(format!("Failed to spawn thread: {e}")))?;
                Worker::Thread { stop, handle }
            }
            WatchdogMode::Process => {
                // SAFETY: the child only touches atomics in the shared mapping, copies
                // bytes, sleeps, and leaves through `_exit` without running destructors.
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child }) => Worker::Process { pid: child },
                    Ok(ForkResult::Child) => {
                        heartbeat_loop(&buffer, budget, interval, None);
                        // SAFETY: terminate the child without unwinding or atexit handlers.
                        unsafe { libc::_exit(0) }
                    }
                    Err(e) => {
                        return Err(TraceError::Watchdog(format!("Failed to fork: {e}")));
                    }
                }
            }
        };

        tracing::debug!(
            mode = ?config.mode,
            heartbeats = budget,
            interval_ms = config.interval_ms,
            "watchdog started"
        );
        Ok(Watchdog {
            worker: Some(worker),
        })
    }

    /// Child pid in process mode
    pub fn pid(&self) -> Option<i32> {
        match &self.worker {
            Some(Worker::Process { pid }) => Some(pid.as_raw()),
            _ => None,
        }
    }

    /// Stop the watchdog and report how that went
    pub fn terminate(mut self) -> TerminationReport {
        self.stop_worker()
    }

    fn stop_worker(&mut self) -> TerminationReport {
        match self.worker.take() {
            None => TerminationReport::Failed {
                reason: "watchdog already terminated".to_string(),
            },
            Some(Worker::Thread { stop, handle }) => {
                let finished = handle.is_finished();
                stop.store(true, Ordering::Release);
                handle.thread().unpark();
                match handle.join() {
                    Ok(beats) if finished => TerminationReport::AlreadyFinished {
                        heartbeats: Some(beats),
                    },
                    Ok(beats) => TerminationReport::Stopped {
                        heartbeats: Some(beats),
                    },
                    Err(_) => TerminationReport::Failed {
                        reason: "watchdog thread panicked".to_string(),
                    },
                }
            }
            Some(Worker::Process { pid }) => terminate_child(pid),
        }
    }
}

fn terminate_child(pid: Pid) -> TerminationReport {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => {}
        Ok(_) => return TerminationReport::AlreadyFinished { heartbeats: None },
        Err(e) => {
            return TerminationReport::Failed {
                reason: format!("waitpid({pid}) failed: {e}"),
            }
        }
    }

    if let Err(e) = kill(pid, Signal::SIGKILL) {
        return TerminationReport::Failed {
            reason: format!("kill({pid}) failed: {e}"),
        };
    }
    match waitpid(pid, None) {
        Ok(_) => TerminationReport::Stopped { heartbeats: None },
        Err(e) => TerminationReport::Failed {
            reason: format!("waitpid({pid}) after kill failed: {e}"),
        },
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let report = self.stop_worker();
            tracing::debug!(%report, "watchdog dropped without explicit termination");
        }
    }
}
