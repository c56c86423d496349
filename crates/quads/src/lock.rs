use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// The store's reader-writer lock, with writer preference and explicit
/// acquire/release. Iterators returned to callers outlive any RAII
/// guard scope, so releasing is the caller's responsibility rather
/// than a guard's.
///
/// Recursive acquisition from the same thread is refused outright:
/// a thread that re-enters while holding either side would deadlock
/// silently under writer preference, and the refusal makes that bug
/// explicit at the call site.
pub struct StoreLock {
    state: Mutex<State>,
    // Readers (and queued writers) wait here for the writer to leave.
    writer_gone: Condvar,
    // Writers wait here for the reader count to drain.
    readers_gone: Condvar,
}

#[derive(Default)]
struct State {
    readers: Vec<ThreadId>,
    writer: Option<ThreadId>,
    waiting_writers: usize,
}

impl Default for StoreLock {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            writer_gone: Condvar::new(),
            readers_gone: Condvar::new(),
        }
    }

    /// Acquire the shared side. Blocks while a writer holds the lock or
    /// is queued for it.
    pub fn acquire_read(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) || state.readers.contains(&me) {
            return Err(Error::RecursiveLock);
        }
        while state.writer.is_some() || state.waiting_writers > 0 {
            self.writer_gone.wait(&mut state);
        }
        state.readers.push(me);
        Ok(())
    }

    pub fn release_read(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.readers.iter().position(|&id| id == me) {
            Some(at) => {
                state.readers.swap_remove(at);
            }
            None => return Err(Error::LockNotHeld),
        }
        if state.readers.is_empty() {
            self.readers_gone.notify_one();
        }
        Ok(())
    }

    /// Acquire the exclusive side. Queued writers block new readers.
    pub fn acquire_write(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) || state.readers.contains(&me) {
            return Err(Error::RecursiveLock);
        }
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            self.readers_gone.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        Ok(())
    }

    pub fn release_write(&self) -> Result<(), Error> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer != Some(me) {
            return Err(Error::LockNotHeld);
        }
        state.writer = None;
        if state.waiting_writers > 0 {
            self.readers_gone.notify_all();
        } else {
            self.writer_gone.notify_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_recursive_read_is_refused() {
        let lock = StoreLock::new();
        lock.acquire_read().unwrap();
        assert!(matches!(lock.acquire_read(), Err(Error::RecursiveLock)));
        lock.release_read().unwrap();
    }

    #[test]
    fn test_read_under_write_is_refused() {
        let lock = StoreLock::new();
        lock.acquire_write().unwrap();
        assert!(matches!(lock.acquire_read(), Err(Error::RecursiveLock)));
        lock.release_write().unwrap();
    }

    #[test]
    fn test_release_without_acquire() {
        let lock = StoreLock::new();
        assert!(matches!(lock.release_read(), Err(Error::LockNotHeld)));
        assert!(matches!(lock.release_write(), Err(Error::LockNotHeld)));
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(StoreLock::new());
        lock.acquire_write().unwrap();

        let contender = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.acquire_read().unwrap();
                lock.release_read().unwrap();
            })
        };
        // The reader cannot get in while the writer holds the lock.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());

        lock.release_write().unwrap();
        contender.join().unwrap();
    }

    #[test]
    fn test_many_concurrent_readers() {
        let lock = Arc::new(StoreLock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    lock.acquire_read().unwrap();
                    std::thread::sleep(Duration::from_millis(10));
                    lock.release_read().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
