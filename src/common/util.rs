//! Small numeric and formatting helpers shared by the block layer.

/// Formats a negative errno as `"(5) Input/output error"`.
pub fn cpp_strerror(r: i32) -> String {
    let code = r.checked_abs().unwrap_or(i32::MAX);
    format!("({}) {}", code, errno_message(code))
}

fn errno_message(code: i32) -> String {
    let msg = std::io::Error::from_raw_os_error(code).to_string();
    // std appends " (os error N)"; keep the bare message
    match msg.rfind(" (os error") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    }
}

/// Rounds `x` down to a multiple of `align` (a power of two).
#[inline]
pub fn p2align(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Rounds `x` up to a multiple of `align` (a power of two).
#[inline]
pub fn p2roundup(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

/// Number of `unit`-sized pieces needed to hold `len` bytes.
#[inline]
pub fn div_round_up(len: u64, unit: u64) -> u64 {
    len.div_ceil(unit)
}

/// 1-based position of the lowest set bit of a hex mask such as `"0x1"` or `"f0"`.
///
/// Returns `Ok(0)` for an all-zero mask and `Err(-EINVAL)` when the string holds a non-hex digit.
pub fn find_first_bitset(s: &str) -> Result<u32, i32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    for (idx, c) in digits.chars().rev().enumerate() {
        let val = c.to_digit(16).ok_or(-libc::EINVAL)?;
        if val != 0 {
            return Ok(idx as u32 * 4 + val.trailing_zeros() + 1);
        }
    }
    Ok(0)
}
