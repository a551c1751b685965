// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

#[macro_export]
macro_rules! round_up {
    ($num:expr, $multiple:expr) => {
        (($num + $multiple - 1) / $multiple) * $multiple
    };
}

#[macro_export]
macro_rules! round_down {
    ($num:expr, $multiple:expr) => {
        $num & !($multiple - 1)
    };
}

pub use crate::error::{MmError, MmResult};
