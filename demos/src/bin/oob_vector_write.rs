// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Adapted from the original tool's `Example2.cpp` sample: an unchecked
//! out-of-bounds write past the end of a small heap-backed buffer, far
//! enough past the allocation to land on an unmapped page.

fn fn3(buffer: &mut [i32]) {
    // Bypass bounds checking entirely: a safe-Rust indexed write at this
    // offset would panic rather than fault, which isn't what this sample
    // is meant to demonstrate.
    unsafe {
        let ptr = buffer.as_mut_ptr();
        *ptr.add(0x1000_0000) = 10;
    }
}

fn fn2(buffer: &mut [i32]) {
    fn3(buffer);
}

fn fn1(buffer: &mut [i32]) {
    fn2(buffer);
}

fn main() {
    let code = deadstop::initialize("deadstop_oob_vector_write.txt", 50, 50, 5);
    if code != deadstop::ErrCode::Success {
        eprintln!("failed to initialize: {}", deadstop::get_error_message(code));
        std::process::exit(1);
    }

    let mut input = vec![0i32; 5];
    fn1(&mut input);
}
