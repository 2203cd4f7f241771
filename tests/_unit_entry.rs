// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

#![allow(clippy::all)]

mod unit_tests {
    pub mod test_close_machine;
    pub mod test_credit;
    pub mod test_cursor;
    pub mod test_handshake;
    pub mod test_proto;
    pub mod test_timer;
    pub mod test_tlv;
}
