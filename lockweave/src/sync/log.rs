// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Allocation-free formatting into the platform debug log.

use arrayvec::ArrayString;

use super::CONFIG_LOG_BUFFER;
use crate::platform::DebugLogProvider;

/// A [`core::fmt::Write`] sink that batches output into a fixed buffer and hands it to
/// [`DebugLogProvider::debug_log_print`] whenever the buffer fills up, and once more on drop.
pub(crate) struct DebugLogWriter<'a, Platform: DebugLogProvider> {
    platform: &'a Platform,
    buf: ArrayString<CONFIG_LOG_BUFFER>,
}

impl<'a, Platform: DebugLogProvider> DebugLogWriter<'a, Platform> {
    pub(crate) fn new(platform: &'a Platform) -> Self {
        Self {
            platform,
            buf: ArrayString::new(),
        }
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            self.platform.debug_log_print(&self.buf);
            self.buf.clear();
        }
    }
}

impl<Platform: DebugLogProvider> core::fmt::Write for DebugLogWriter<'_, Platform> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.buf.try_push_str(s).is_ok() {
            return Ok(());
        }
        self.flush();
        if self.buf.try_push_str(s).is_err() {
            // Larger than the whole buffer; pass it straight through.
            self.platform.debug_log_print(s);
        }
        Ok(())
    }
}

impl<Platform: DebugLogProvider> Drop for DebugLogWriter<'_, Platform> {
    fn drop(&mut self) {
        self.flush();
    }
}
