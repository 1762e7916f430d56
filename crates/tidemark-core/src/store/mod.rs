// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit ledger and lock store backends.

pub mod memory;
pub mod sqlite;
