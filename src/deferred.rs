// Copyright (c) 2026 The vk-rtas developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Deferred host operations and the protocol for finishing them.
//!
//! A [`DeferredOperation`] is passed to a host-side build/copy entry point,
//! which may complete the work immediately or hand it back to be finished
//! later. Finishing means calling `join` repeatedly, possibly from several
//! threads at once, until the implementation reports completion, then querying
//! the operation's result. The join entry point is required to support
//! concurrent callers on one operation; that is the one place this crate is
//! multi-threaded.

use crate::{device::RayTracingDevice, VulkanError};
use ash::vk;

/// Upper bound on worker threads for a multi-threaded finish, applied on top
/// of the implementation-reported maximum concurrency.
pub const MAX_WORKER_THREADS: u32 = 256;

/// Sentinel worker count meaning "use the operation's maximum concurrency".
pub const WORKER_THREADS_MAX: u32 = u32::MAX;

/// An operation on the host that may have been deferred.
pub struct DeferredOperation {
    fns: ash::khr::deferred_host_operations::Device,
    handle: vk::DeferredOperationKHR,
}

impl std::fmt::Debug for DeferredOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredOperation")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// What `join` reported about the operation's progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinStatus {
    /// The operation completed; its result can be queried.
    Complete,
    /// Another thread is wrapping the operation up; poll the result instead.
    ThreadDone,
    /// No work was available right now, but there may be later.
    ThreadIdle,
}

impl DeferredOperation {
    pub fn new(device: &RayTracingDevice) -> Result<Self, VulkanError> {
        let fns = device.deferred_operation_fns().clone();
        let handle = unsafe { fns.create_deferred_operation(None) }.map_err(VulkanError::from)?;

        Ok(Self { fns, handle })
    }

    #[inline]
    pub fn handle(&self) -> vk::DeferredOperationKHR {
        self.handle
    }

    /// Executes a portion of the operation on the current thread.
    ///
    /// Panics on any result code outside the closed set the specification
    /// allows for `vkDeferredOperationJoinKHR`.
    pub fn join(&self) -> JoinStatus {
        let result =
            unsafe { (self.fns.fp().deferred_operation_join_khr)(self.fns.device(), self.handle) };

        match result {
            vk::Result::SUCCESS => JoinStatus::Complete,
            vk::Result::THREAD_DONE_KHR => JoinStatus::ThreadDone,
            vk::Result::THREAD_IDLE_KHR => JoinStatus::ThreadIdle,
            other => panic!("unexpected result from deferred operation join: {:?}", other),
        }
    }

    /// The operation's result, or `None` while it is still executing.
    pub fn result(&self) -> Option<Result<(), VulkanError>> {
        let result = unsafe {
            (self.fns.fp().get_deferred_operation_result_khr)(self.fns.device(), self.handle)
        };

        match result {
            vk::Result::NOT_READY => None,
            vk::Result::SUCCESS => Some(Ok(())),
            error => Some(Err(VulkanError::from(error))),
        }
    }

    /// The maximum number of threads that could usefully join the operation
    /// right now.
    pub fn max_concurrency(&self) -> u32 {
        unsafe {
            (self.fns.fp().get_deferred_operation_max_concurrency_khr)(
                self.fns.device(),
                self.handle,
            )
        }
    }
}

impl Drop for DeferredOperation {
    fn drop(&mut self) {
        // Destruction requires the operation to be complete. Every code path
        // in this crate finishes the operation before dropping it, but a
        // panicking test can unwind past the finish call, so drive it to
        // completion rather than trip validation.
        if self.result().is_none() {
            let _ = finish_single_threaded(self);
        }
        unsafe {
            (self.fns.fp().destroy_deferred_operation_khr)(
                self.fns.device(),
                self.handle,
                std::ptr::null(),
            )
        };
    }
}

/// Joins `operation` from the calling thread until it completes, then returns
/// its result.
///
/// There is no blocking wait for this state in the API; the documented
/// protocol is to spin, yielding the thread between attempts.
pub fn finish_single_threaded(operation: &DeferredOperation) -> Result<(), VulkanError> {
    loop {
        match operation.join() {
            JoinStatus::ThreadIdle => std::thread::yield_now(),
            JoinStatus::Complete => {
                return operation
                    .result()
                    .expect("operation reported complete but result is not ready");
            }
            JoinStatus::ThreadDone => {
                // Another thread owns the wrap-up; poll until it lands.
                loop {
                    if let Some(result) = operation.result() {
                        return result;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Resolves the number of worker threads to spawn from the caller's request
/// and the implementation-reported maximum.
///
/// Panics when the implementation reports a maximum concurrency of zero for a
/// pending operation, which the specification forbids.
fn resolve_thread_count(requested: u32, max_concurrency: u32) -> u32 {
    let supported = max_concurrency.min(MAX_WORKER_THREADS);
    assert!(
        supported > 0,
        "implementation reported zero max concurrency for a pending deferred operation"
    );

    if requested == WORKER_THREADS_MAX {
        supported
    } else {
        requested
    }
}

/// Finishes `operation` by joining it from `requested` worker threads at once
/// (or the reported maximum, for [`WORKER_THREADS_MAX`]).
///
/// Exactly one joining thread wins the race to observe `SUCCESS`; the others
/// legitimately see an error-free non-success path. The finish succeeds if
/// any thread succeeded, and panics if none did.
pub fn finish_multi_threaded(
    operation: &DeferredOperation,
    requested: u32,
) -> Result<(), VulkanError> {
    let thread_count = resolve_thread_count(requested, operation.max_concurrency());
    let mut results: Vec<Option<Result<(), VulkanError>>> = vec![None; thread_count as usize];

    std::thread::scope(|scope| {
        for slot in results.iter_mut() {
            scope.spawn(|| *slot = Some(finish_single_threaded(operation)));
        }
    });

    let succeeded = results
        .iter()
        .any(|result| matches!(result, Some(Ok(()))));
    if succeeded {
        return Ok(());
    }

    // Surface a real device error if one was reported; anything else means
    // the join protocol itself misbehaved.
    for result in results.into_iter().flatten() {
        result?;
    }
    panic!("no thread observed success while finishing a deferred operation");
}

/// Finishes an operation after the triggering entry point returned.
///
/// `operation_not_deferred` is set when that entry point reported
/// `VK_OPERATION_NOT_DEFERRED_KHR`: the work already completed synchronously
/// and joining would be wrong, so only the result is fetched. Otherwise the
/// finish runs single-threaded, or across `worker_thread_count` threads when
/// a nonzero count was configured.
pub fn finish(
    operation: &DeferredOperation,
    worker_thread_count: u32,
    operation_not_deferred: bool,
) -> Result<(), VulkanError> {
    if operation_not_deferred {
        return operation
            .result()
            .expect("non-deferred operation has no result");
    }

    if worker_thread_count == 0 {
        finish_single_threaded(operation)
    } else {
        finish_multi_threaded(operation, worker_thread_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_caps_at_supported_maximum() {
        assert_eq!(resolve_thread_count(WORKER_THREADS_MAX, 4), 4);
        assert_eq!(resolve_thread_count(WORKER_THREADS_MAX, 1024), 256);
        assert_eq!(resolve_thread_count(2, 4), 2);
        assert_eq!(resolve_thread_count(8, 4), 8);
    }

    #[test]
    #[should_panic(expected = "zero max concurrency")]
    fn zero_concurrency_is_a_contract_violation() {
        resolve_thread_count(2, 0);
    }
}
