//! Cross-process mutexes and condition variables embedded in the lock file.
//!
//! The shared state (`SharedMutexPart` / `SharedCondVarPart`) lives inside
//! the mapped `SharedInfo` structure and is therefore shared by name across
//! processes. Wrappers ([`SharedMutex`], [`SharedCondVar`]) are per-handle
//! and hold only a pointer into the mapping.
//!
//! Mutexes are robust: when a holder process dies, the next acquirer
//! observes the owner-dead condition, marks the mutex consistent, and is
//! expected to re-establish the protected invariants. Process-shared
//! mutexes are never destroyed; peers may keep using one after the
//! initializing process exits, and re-initializing over a crashed peer's
//! state is the recovery path (bootstrap rewrites the whole lock file).
//!
//! Condition variables are paired with auxiliary files under the
//! coordination directory. On platforms where interprocess condvars must be
//! emulated those files carry the wait queue; here they only reserve the
//! stable names.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::io;
use std::mem::{self, MaybeUninit};
use std::path::{Path, PathBuf};

use loam_error::{LoamError, Result};
use tracing::warn;

/// Map a `pthread_*` return code to a `Result`.
fn check(code: libc::c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(LoamError::Io(io::Error::from_raw_os_error(code)))
    }
}

// ---------------------------------------------------------------------------
// Shared parts (the bytes that live in the lock file)
// ---------------------------------------------------------------------------

/// Shared state of a cross-process mutex.
///
/// Copied byte-for-byte into the lock file in its freshly initialized,
/// unlocked state during bootstrap.
#[repr(C)]
pub struct SharedMutexPart {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// Safety: the bytes are only ever operated on through pthread process-shared
// primitives, which synchronize internally across threads and processes.
unsafe impl Send for SharedMutexPart {}
unsafe impl Sync for SharedMutexPart {}

impl SharedMutexPart {
    /// Initialize a process-shared, robust mutex in place.
    ///
    /// # Safety
    ///
    /// `part` must point at writable memory with no other party accessing
    /// it (bootstrap runs under the exclusive file lock).
    pub unsafe fn init(part: *mut Self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let r = (|| {
            check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            check(libc::pthread_mutexattr_setrobust(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            check(libc::pthread_mutex_init((*part).inner.get(), attr.as_ptr()))
        })();
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        r
    }
}

/// Shared state of a cross-process condition variable.
#[repr(C)]
pub struct SharedCondVarPart {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// Safety: same reasoning as SharedMutexPart.
unsafe impl Send for SharedCondVarPart {}
unsafe impl Sync for SharedCondVarPart {}

impl SharedCondVarPart {
    /// Initialize a process-shared condition variable in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutexPart::init`].
    pub unsafe fn init(part: *mut Self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let r = (|| {
            check(libc::pthread_condattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_cond_init((*part).inner.get(), attr.as_ptr()))
        })();
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        r
    }
}

// ---------------------------------------------------------------------------
// SharedMutex
// ---------------------------------------------------------------------------

/// Per-handle view of a mutex whose state lives in the lock-file mapping.
pub struct SharedMutex {
    part: *const SharedMutexPart,
    name: &'static str,
}

// Safety: the wrapper is just a pointer plus a name. The pointed-to state is
// process-shared by design and every operation goes through pthread calls,
// which are thread-safe.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Attach to a shared part inside a mapping.
    ///
    /// # Safety
    ///
    /// `part` must point at an initialized `SharedMutexPart` inside a
    /// mapping that outlives the wrapper and never moves.
    #[must_use]
    pub unsafe fn attach(part: *const SharedMutexPart, name: &'static str) -> Self {
        Self { part, name }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        // Safety: `part` is valid per the attach contract.
        unsafe { (*self.part).inner.get() }
    }

    /// Lock, returning a guard that unlocks on drop.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>> {
        let owner_died = self.lock_unguarded()?;
        Ok(SharedMutexGuard {
            mutex: self,
            owner_died,
        })
    }

    /// Lock without a guard. The caller must pair this with
    /// [`unlock_unguarded`](Self::unlock_unguarded); used where the hold
    /// spans several calls (the write mutex across a whole transaction).
    ///
    /// Returns `true` if the previous owner died while holding the mutex.
    /// The mutex has then been marked consistent, and the caller must
    /// re-validate the invariants it protects.
    pub fn lock_unguarded(&self) -> Result<bool> {
        // Safety: `part` is valid per the attach contract.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        match rc {
            0 => Ok(false),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::EOWNERDEAD => {
                warn!(
                    mutex = self.name,
                    "recovering mutex abandoned by a dead owner"
                );
                // Safety: we own the mutex (EOWNERDEAD grants ownership).
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw()) };
                if rc != 0 {
                    self.unlock_unguarded();
                    return Err(LoamError::Io(io::Error::from_raw_os_error(rc)));
                }
                Ok(true)
            }
            code => Err(LoamError::Io(io::Error::from_raw_os_error(code))),
        }
    }

    /// Unlock a mutex locked with [`lock_unguarded`](Self::lock_unguarded).
    pub fn unlock_unguarded(&self) {
        // Safety: `part` is valid per the attach contract; the caller holds
        // the mutex.
        let rc = unsafe { libc::pthread_mutex_unlock(self.raw()) };
        debug_assert_eq!(rc, 0, "unlock of mutex '{}' failed: {rc}", self.name);
    }

    /// Probe whether the shared state behaves like a mutex at all.
    ///
    /// A crashed peer (or a layout mismatch the size checks did not catch)
    /// can leave bytes here that are not a valid mutex. Try-locking is the
    /// best available probe.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        // Safety: `part` is valid per the attach contract.
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        match rc {
            0 => {
                self.unlock_unguarded();
                true
            }
            libc::EBUSY => true,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            libc::EOWNERDEAD => {
                // The trylock granted us ownership of an abandoned mutex.
                // Mark it consistent and release it, or the real lock
                // attempt that follows would deadlock.
                warn!(mutex = self.name, "validity probe found a dead owner");
                // Safety: we own the mutex.
                unsafe {
                    libc::pthread_mutex_consistent(self.raw());
                }
                self.unlock_unguarded();
                true
            }
            _ => false,
        }
    }
}

/// RAII guard for [`SharedMutex::lock`].
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    owner_died: bool,
}

impl SharedMutexGuard<'_> {
    /// Whether the previous owner died holding the mutex.
    #[must_use]
    pub fn owner_died(&self) -> bool {
        self.owner_died
    }

    pub(crate) fn raw_mutex(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.raw()
    }
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock_unguarded();
    }
}

// ---------------------------------------------------------------------------
// SharedCondVar
// ---------------------------------------------------------------------------

/// Per-handle view of a condition variable in the lock-file mapping, plus
/// its auxiliary file under the coordination directory.
pub struct SharedCondVar {
    part: *const SharedCondVarPart,
    aux_path: PathBuf,
}

// Safety: same reasoning as SharedMutex.
unsafe impl Send for SharedCondVar {}
unsafe impl Sync for SharedCondVar {}

impl SharedCondVar {
    /// Attach to a shared part and reserve the auxiliary file
    /// `<prefix>.<name>` (or the same file name under `temp_dir` when one
    /// is configured).
    ///
    /// # Safety
    ///
    /// `part` must point at an initialized `SharedCondVarPart` inside a
    /// mapping that outlives the wrapper and never moves.
    pub unsafe fn attach(
        part: *const SharedCondVarPart,
        prefix: &Path,
        name: &str,
        temp_dir: Option<&Path>,
    ) -> Result<Self> {
        let file_name = format!(
            "{}.{name}",
            prefix
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "access_control".to_owned())
        );
        let aux_path = match temp_dir {
            Some(dir) => dir.join(file_name),
            None => prefix.with_file_name(file_name),
        };
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&aux_path)?;
        Ok(Self { part, aux_path })
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        // Safety: `part` is valid per the attach contract.
        unsafe { (*self.part).inner.get() }
    }

    /// Auxiliary file backing this condvar.
    #[must_use]
    pub fn aux_path(&self) -> &Path {
        &self.aux_path
    }

    /// Wait on the condvar. The caller must hold the mutex the guard came
    /// from; spurious wakeups are possible and the predicate must be
    /// rechecked.
    pub fn wait(&self, guard: &SharedMutexGuard<'_>) -> Result<()> {
        // Safety: both pointers are valid per their attach contracts, and
        // the guard proves the mutex is held by this thread.
        let rc = unsafe { libc::pthread_cond_wait(self.raw(), guard.raw_mutex()) };
        check(rc)
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        // Safety: `part` is valid per the attach contract.
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw()) };
        debug_assert_eq!(rc, 0, "condvar broadcast failed: {rc}");
    }
}

/// Shared-part sizes recorded in the lock file for layout negotiation.
#[must_use]
pub fn mutex_part_size() -> u8 {
    u8::try_from(mem::size_of::<SharedMutexPart>()).expect("mutex part exceeds negotiable size")
}

/// See [`mutex_part_size`].
#[must_use]
pub fn condvar_part_size() -> u8 {
    u8::try_from(mem::size_of::<SharedCondVarPart>()).expect("condvar part exceeds negotiable size")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn leaked_mutex() -> &'static SharedMutexPart {
        let part: &'static mut MaybeUninit<SharedMutexPart> =
            Box::leak(Box::new(MaybeUninit::zeroed()));
        unsafe {
            SharedMutexPart::init(part.as_mut_ptr()).expect("mutex init");
            part.assume_init_ref()
        }
    }

    fn leaked_condvar() -> &'static SharedCondVarPart {
        let part: &'static mut MaybeUninit<SharedCondVarPart> =
            Box::leak(Box::new(MaybeUninit::zeroed()));
        unsafe {
            SharedCondVarPart::init(part.as_mut_ptr()).expect("condvar init");
            part.assume_init_ref()
        }
    }

    #[test]
    fn test_mutex_lock_unlock() {
        let part = leaked_mutex();
        let mutex = unsafe { SharedMutex::attach(part, "test") };
        {
            let guard = mutex.lock().expect("lock");
            assert!(!guard.owner_died());
        }
        // Relockable after the guard dropped.
        drop(mutex.lock().expect("relock"));
    }

    #[test]
    fn test_mutex_is_valid() {
        let part = leaked_mutex();
        let mutex = unsafe { SharedMutex::attach(part, "test") };
        assert!(mutex.is_valid());
        // Still valid while held.
        let _guard = mutex.lock().expect("lock");
        assert!(mutex.is_valid());
    }

    #[test]
    fn test_condvar_aux_file_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("access_control");
        let part = leaked_condvar();
        let cv = unsafe { SharedCondVar::attach(part, &prefix, "new_commit", None) }
            .expect("attach condvar");
        assert_eq!(
            cv.aux_path(),
            dir.path().join("access_control.new_commit").as_path()
        );
        assert!(cv.aux_path().exists());
    }

    #[test]
    fn test_condvar_wakes_waiter() {
        static TURN: AtomicU32 = AtomicU32::new(0);

        let mutex_part = leaked_mutex();
        let cv_part = leaked_condvar();
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("access_control");

        let waiter = std::thread::spawn(move || {
            let mutex = unsafe { SharedMutex::attach(mutex_part, "w") };
            let cv = unsafe { SharedCondVar::attach(cv_part, &prefix, "wake", None) }
                .expect("attach");
            let guard = mutex.lock().expect("lock");
            TURN.store(1, Ordering::Release);
            while TURN.load(Ordering::Acquire) != 2 {
                cv.wait(&guard).expect("wait");
            }
        });

        let mutex = unsafe { SharedMutex::attach(mutex_part, "n") };
        let cv = unsafe {
            SharedCondVar::attach(cv_part, &dir.path().join("access_control"), "wake2", None)
        }
        .expect("attach");
        while TURN.load(Ordering::Acquire) != 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        {
            let _guard = mutex.lock().expect("lock");
            TURN.store(2, Ordering::Release);
            cv.notify_all();
        }
        waiter.join().expect("waiter thread");
    }
}
