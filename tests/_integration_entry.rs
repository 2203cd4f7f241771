// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod attach_cancel;
    pub mod backpressure;
    pub mod disorder_dispatch;
    pub mod half_close;
    pub mod loopback_echo;
    pub mod tlv_reject;
}
