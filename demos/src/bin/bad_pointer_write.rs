// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adapted from the original tool's `Example3.cpp` sample: a write through
//! a fixed, clearly-bogus pointer value.

fn bad_function() {
    let ptr = 0xCDCD_CDCD_CDCD_CDCDu64 as *mut i32;
    unsafe {
        *ptr = 1;
    }
}

fn main() {
    let code = deadstop::initialize("deadstop_bad_pointer_write.txt", 50, 50, 8);
    if code != deadstop::ErrCode::Success {
        eprintln!("failed to initialize: {}", deadstop::get_error_message(code));
        std::process::exit(1);
    }
    bad_function();
}
