// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # lockweave
//!
//! > An adaptive mutex, a condition variable, and a deadlock-cycle detector, woven around a single
//! > lock word.
//!
//! lockweave exposes [`sync::Mutex`] (exclusive and shared modes, conditional critical sections)
//! and [`sync::CondVar`] when it is provided a `Platform` interface "below" that knows how to
//! park and unpark threads, tell time, capture stacks, and print debug output.
//!
//! To use lockweave, you must provide a type that implements the [`platform::Provider`] trait;
//! see `lockweave_platform_linux_userland` for a ready-made Linux implementation.

#![no_std]

extern crate alloc;

pub mod platform;
pub mod sync;
