//! Plugin worker threads.
//!
//! Each plugin runs on its own thread that owns the Lua state. The network
//! thread hands it [`Job`]s over an mpsc channel and never waits on a
//! handler. The only blocking exchange is the initialization handshake,
//! bounded by [`PLUGIN_LOAD_TIMEOUT`].
//!
//! Between jobs the worker fires the plugin's due timers, and it waits for
//! the next job no longer than the earliest timer deadline.
//!
//! ```text
//!   network thread ──Job::Event──▶ channel ──▶ worker: PluginRuntime::dispatch
//!                  ──Job::Unload─▶ (FIFO: earlier events run first) ──▶ onUnload
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::handlers::Hook;
use super::runtime::PluginRuntime;
use crate::bridge::{Bridge, HandleId};
use crate::config::PluginConfig;
use crate::constants::PLUGIN_LOAD_TIMEOUT;
use crate::error::{Error, Result};
use crate::irc::{Event, EventKind};

/// Work item for a plugin thread.
#[derive(Debug)]
pub enum Job {
    /// Call the handler for `event` with `server` as first argument.
    Event {
        /// Handle of the server the event came from.
        server: HandleId,
        /// The event.
        event: Event,
    },
    /// Call `onReload`.
    Reload,
    /// Run a full garbage collection cycle.
    CollectGarbage,
    /// Drain, call `onUnload` and exit.
    Unload,
}

/// Handle to a running plugin thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    jobs: mpsc::Sender<Job>,
    pending: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker for `config` and wait for its initialization.
    ///
    /// Returns the event kinds the plugin binds.
    pub fn spawn(config: PluginConfig, bridge: Arc<Bridge>) -> Result<(Self, BTreeSet<EventKind>)> {
        let name = config.name.clone();
        let (jobs_tx, jobs_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let pending = Arc::new(AtomicUsize::new(0));

        let thread_pending = Arc::clone(&pending);
        let thread = thread::Builder::new()
            .name(format!("plugin-{name}"))
            .spawn(move || {
                let runtime = match PluginRuntime::new(&config, bridge) {
                    Ok(runtime) => {
                        let _ = init_tx.send(Ok(runtime.kinds()));
                        runtime
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                run(runtime, &jobs_rx, &thread_pending);
            })
            .map_err(|e| Error::plugin_load(&name, e))?;

        match init_rx.recv_timeout(PLUGIN_LOAD_TIMEOUT) {
            Ok(Ok(kinds)) => Ok((
                Self {
                    name,
                    jobs: jobs_tx,
                    pending,
                    thread: Some(thread),
                },
                kinds,
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            // The thread is left to finish on its own; with the job sender
            // gone it unloads right after initialization.
            Err(RecvTimeoutError::Timeout) => Err(Error::plugin_load(
                &name,
                format!("initialization took longer than {PLUGIN_LOAD_TIMEOUT:?}"),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(Error::plugin_load(&name, "worker exited during initialization"))
            }
        }
    }

    /// Queue `job`. Returns false if the thread has already exited.
    pub fn send(&self, job: Job) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::debug!("Plugin {} worker is gone", self.name);
            return false;
        }
        true
    }

    /// True when every queued job has been processed.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// True once the thread has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Plugin {} worker panicked", self.name);
            }
        }
    }
}

/// Next job, or `None` once the sender is gone. Due timers fire while
/// waiting.
fn next_job(runtime: &PluginRuntime, jobs: &mpsc::Receiver<Job>) -> Option<Job> {
    loop {
        runtime.fire_timers();
        let Some(deadline) = runtime.next_timer() else {
            return jobs.recv().ok();
        };
        match jobs.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(job) => return Some(job),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

fn run(runtime: PluginRuntime, jobs: &mpsc::Receiver<Job>, pending: &AtomicUsize) {
    while let Some(job) = next_job(&runtime, jobs) {
        let keep_going = match job {
            Job::Event { server, event } => {
                if let Err(e) = runtime.dispatch(server, &event) {
                    log::warn!("Plugin {}: {:#}", runtime.name(), e);
                }
                true
            }
            Job::Reload => {
                match runtime.call_hook(Hook::Reload) {
                    Ok(true) => log::info!("Reloaded plugin {}", runtime.name()),
                    Ok(false) => log::debug!("Plugin {} has no onReload", runtime.name()),
                    Err(e) => log::warn!("Plugin {}: {:#}", runtime.name(), e),
                }
                true
            }
            Job::CollectGarbage => {
                if let Err(e) = runtime.collect_garbage() {
                    log::warn!("Plugin {}: {:#}", runtime.name(), e);
                }
                true
            }
            Job::Unload => false,
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        if !keep_going {
            break;
        }
    }
    runtime.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::net::Notifier;
    use crate::server::Server;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn write_plugin(dir: &Path, name: &str, source: &str) -> PluginConfig {
        let path = dir.join(format!("{name}.lua"));
        std::fs::write(&path, source).unwrap();
        PluginConfig::new(name, path)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_spawn_reports_bound_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_plugin(dir.path(), "p", "function onPing() end");

        let (mut worker, kinds) = Worker::spawn(config, Arc::new(Bridge::new())).unwrap();
        assert_eq!(kinds, BTreeSet::from([EventKind::Ping]));
        assert!(worker.send(Job::Unload));
        worker.join();
        assert!(worker.is_finished());
        assert!(!worker.send(Job::Reload));
    }

    #[test]
    fn test_spawn_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_plugin(dir.path(), "bad", "this is not lua");

        let err = Worker::spawn(config, Arc::new(Bridge::new())).unwrap_err();
        assert!(matches!(err, Error::PluginLoad { .. }));
    }

    #[test]
    fn test_events_before_unload_are_drained() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let config = write_plugin(
            dir.path(),
            "drain",
            &format!(
                r#"
                count = 0
                function onPing() count = count + 1 end
                function onUnload()
                    local f = io.open("{}", "w")
                    f:write(tostring(count))
                    f:close()
                end
                "#,
                out.display()
            ),
        );

        let mut bridge = Bridge::new();
        bridge.register_class::<Server>();
        let bridge = Arc::new(bridge);
        let server = bridge.expose(Arc::new(Server::new(
            ServerConfig::new("local", "127.0.0.1", 6667, "bot"),
            Notifier::disabled(),
        )));

        let (mut worker, _) = Worker::spawn(config, Arc::clone(&bridge)).unwrap();
        for _ in 0..10 {
            worker.send(Job::Event {
                server,
                event: Event::Ping { token: "x".into() },
            });
        }
        worker.send(Job::Unload);
        wait_until(|| worker.is_finished());
        worker.join();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "10");
        assert!(worker.is_idle());
        assert_eq!(bridge.handles().script_refs(server), 0);
    }

    #[test]
    fn test_timers_fire_without_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("ticks.txt");
        let config = write_plugin(
            dir.path(),
            "ticker",
            &format!(
                r#"
                count = 0
                id = timer.every(0.01, function()
                    count = count + 1
                    if count == 3 then
                        timer.cancel(id)
                        local f = io.open("{}", "w")
                        f:write(tostring(count))
                        f:close()
                    end
                end)
                function onUnload()
                    local f = io.open("{}", "w")
                    f:write(tostring(count))
                    f:close()
                end
                "#,
                out.display(),
                out.display()
            ),
        );

        let (mut worker, _) = Worker::spawn(config, Arc::new(Bridge::new())).unwrap();
        wait_until(|| out.exists());
        thread::sleep(Duration::from_millis(50));
        worker.send(Job::Unload);
        wait_until(|| worker.is_finished());
        worker.join();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "3");
    }
}
