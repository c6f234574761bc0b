// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Scoped holds of a [`Mutex`].

use super::RawSyncPrimitivesProvider;
use super::mutex::Mutex;

/// An exclusive hold of a [`Mutex`], released when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, Platform: RawSyncPrimitivesProvider> {
    mutex: &'a Mutex<Platform>,
}

impl<'a, Platform: RawSyncPrimitivesProvider> MutexGuard<'a, Platform> {
    pub(crate) fn new(mutex: &'a Mutex<Platform>) -> Self {
        Self { mutex }
    }

    /// The held mutex, e.g. for [`Mutex::await_condition`] or [`CondVar::wait`].
    ///
    /// [`CondVar::wait`]: super::CondVar::wait
    pub fn mutex(&self) -> &'a Mutex<Platform> {
        self.mutex
    }
}

impl<Platform: RawSyncPrimitivesProvider> Drop for MutexGuard<'_, Platform> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A shared hold of a [`Mutex`], released when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct ReaderMutexGuard<'a, Platform: RawSyncPrimitivesProvider> {
    mutex: &'a Mutex<Platform>,
}

impl<'a, Platform: RawSyncPrimitivesProvider> ReaderMutexGuard<'a, Platform> {
    pub(crate) fn new(mutex: &'a Mutex<Platform>) -> Self {
        Self { mutex }
    }

    /// The held mutex.
    pub fn mutex(&self) -> &'a Mutex<Platform> {
        self.mutex
    }
}

impl<Platform: RawSyncPrimitivesProvider> Drop for ReaderMutexGuard<'_, Platform> {
    fn drop(&mut self) {
        self.mutex.reader_unlock();
    }
}
