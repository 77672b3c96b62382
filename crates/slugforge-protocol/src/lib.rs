// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire protocol for the slugforge build channel.
//!
//! The controller and the build agent share a single hijacked byte
//! stream and multiplex three kinds of traffic over it: build log
//! output for the end user, file transfers (source tarball, slug,
//! Procfile) and a terminal status code. This crate provides the
//! framing for that stream; it knows nothing about HTTP, the PaaS or
//! the build choreography.

pub mod frame;

pub use frame::{
    BuildStatus, Frame, FrameError, FrameType, LineFramer, MAX_FRAME_SIZE, copy_frame, read_frame,
    read_file_frame, write_frame, write_status, write_user,
};
