// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adapted from the original tool's `main.cpp` sample: a function that
//! writes through a null pointer, triggering SIGSEGV.

fn bad_function() {
    let ptr: *mut i32 = std::ptr::null_mut();
    unsafe {
        *ptr = 42;
    }
}

fn main() {
    let code = deadstop::initialize("deadstop_null_deref.txt", 50, 5, 3);
    if code != deadstop::ErrCode::Success {
        eprintln!("failed to initialize: {}", deadstop::get_error_message(code));
        std::process::exit(1);
    }
    bad_function();
}
