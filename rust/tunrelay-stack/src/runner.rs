//! Cooperative single-thread task scheduler.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Default pause after a round in which no task did any work.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// A unit of work polled by a [`TaskRunner`].
pub trait Task: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Do a bounded amount of work. Returns true if anything was done.
    fn run_once(&mut self) -> Result<bool>;

    fn terminate(&mut self) {}
}

/// Calls every task once per round, sleeping only after an idle round.
/// An error from any task ends the runner and terminates all tasks.
pub struct TaskRunner {
    tasks: Vec<Box<dyn Task>>,
    idle_sleep: Duration,
    running: Arc<AtomicBool>,
}

impl TaskRunner {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            tasks: Vec::new(),
            idle_sleep: DEFAULT_IDLE_SLEEP,
            running,
        }
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn add(mut self, task: Box<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run until the shared flag is cleared or a task fails.
    pub fn run(mut self) -> Result<()> {
        for i in 0..self.tasks.len() {
            if let Err(e) = self.tasks[i].initialize() {
                error!("task {} failed to initialize: {}", self.tasks[i].name(), e);
                self.terminate_all();
                return Err(e);
            }
        }

        let result = self.run_rounds();
        self.terminate_all();
        result
    }

    fn run_rounds(&mut self) -> Result<()> {
        while self.running.load(Ordering::Relaxed) {
            let mut worked = false;
            for task in self.tasks.iter_mut() {
                match task.run_once() {
                    Ok(did) => worked |= did,
                    Err(e) => {
                        error!("task {} failed: {}", task.name(), e);
                        return Err(e);
                    }
                }
            }
            if !worked {
                std::thread::sleep(self.idle_sleep);
            }
        }
        Ok(())
    }

    fn terminate_all(&mut self) {
        for task in self.tasks.iter_mut() {
            debug!("terminating task {}", task.name());
            task.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackError;
    use parking_lot::Mutex;

    struct Scripted {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        rounds: usize,
        fail_at: Option<usize>,
        stop_at: Option<(usize, Arc<AtomicBool>)>,
    }

    impl Scripted {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: log.clone(),
                rounds: 0,
                fail_at: None,
                stop_at: None,
            }
        }
    }

    impl Task for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&mut self) -> Result<()> {
            self.log.lock().push(format!("{}:init", self.name));
            Ok(())
        }

        fn run_once(&mut self) -> Result<bool> {
            self.rounds += 1;
            self.log.lock().push(format!("{}:{}", self.name, self.rounds));
            if self.fail_at == Some(self.rounds) {
                return Err(StackError::ChannelClosed);
            }
            if let Some((at, flag)) = &self.stop_at {
                if *at == self.rounds {
                    flag.store(false, Ordering::Relaxed);
                }
            }
            Ok(false)
        }

        fn terminate(&mut self) {
            self.log.lock().push(format!("{}:term", self.name));
        }
    }

    #[test]
    fn test_round_robin_until_stopped() {
        let running = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reader = Scripted::new("r", &log);
        reader.stop_at = Some((2, running.clone()));
        let writer = Scripted::new("w", &log);

        TaskRunner::new(running)
            .with_idle_sleep(Duration::from_millis(1))
            .add(Box::new(reader))
            .add(Box::new(writer))
            .run()
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["r:init", "w:init", "r:1", "w:1", "r:2", "w:2", "r:term", "w:term"]
        );
    }

    #[test]
    fn test_error_terminates_all_tasks() {
        let running = Arc::new(AtomicBool::new(true));
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reader = Scripted::new("r", &log);
        reader.fail_at = Some(1);
        let writer = Scripted::new("w", &log);

        let result = TaskRunner::new(running)
            .with_idle_sleep(Duration::from_millis(1))
            .add(Box::new(reader))
            .add(Box::new(writer))
            .run();

        assert!(matches!(result, Err(StackError::ChannelClosed)));
        assert_eq!(*log.lock(), vec!["r:init", "w:init", "r:1", "r:term", "w:term"]);
    }
}
