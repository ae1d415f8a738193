//! vDSP bindings for the Accelerate framework
//! Hardware-accelerated buffer math on Apple targets, scalar elsewhere

#![allow(non_camel_case_types)]

#[cfg(target_os = "macos")]
use std::os::raw::c_int;

// vDSP stride type
#[cfg(target_os = "macos")]
pub type vDSP_Stride = c_int;
#[cfg(target_os = "macos")]
pub type vDSP_Length = usize;

#[cfg(target_os = "macos")]
#[link(name = "Accelerate", kind = "framework")]
extern "C" {
    // Vector addition: C = A + B
    fn vDSP_vadd(
        a: *const f32,
        stride_a: vDSP_Stride,
        b: *const f32,
        stride_b: vDSP_Stride,
        c: *mut f32,
        stride_c: vDSP_Stride,
        n: vDSP_Length,
    );

    // Vector scalar multiply: C = A * scalar
    fn vDSP_vsmul(
        a: *const f32,
        stride_a: vDSP_Stride,
        scalar: *const f32,
        c: *mut f32,
        stride_c: vDSP_Stride,
        n: vDSP_Length,
    );

    // Maximum magnitude (absolute value)
    fn vDSP_maxmgv(
        a: *const f32,
        stride: vDSP_Stride,
        result: *mut f32,
        n: vDSP_Length,
    );

    // Clear (fill with zero)
    fn vDSP_vclr(
        c: *mut f32,
        stride: vDSP_Stride,
        n: vDSP_Length,
    );
}

/// Safe wrapper for the buffer operations the render path performs
pub struct VDsp;

impl VDsp {
    /// Accumulate one buffer into another: out = out + input
    #[inline]
    pub fn add_to(input: &[f32], output: &mut [f32]) {
        let len = input.len().min(output.len());
        if len == 0 {
            return;
        }
        #[cfg(target_os = "macos")]
        unsafe {
            vDSP_vadd(
                input.as_ptr(),
                1,
                output.as_ptr(),
                1,
                output.as_mut_ptr(),
                1,
                len,
            );
        }
        #[cfg(not(target_os = "macos"))]
        for (out, x) in output[..len].iter_mut().zip(&input[..len]) {
            *out += x;
        }
    }

    /// Apply gain to a buffer in-place: buf = buf * gain
    #[inline]
    pub fn apply_gain(buf: &mut [f32], gain: f32) {
        if buf.is_empty() {
            return;
        }
        #[cfg(target_os = "macos")]
        unsafe {
            vDSP_vsmul(buf.as_ptr(), 1, &gain, buf.as_mut_ptr(), 1, buf.len());
        }
        #[cfg(not(target_os = "macos"))]
        for x in buf.iter_mut() {
            *x *= gain;
        }
    }

    /// Clear a buffer (fill with zeros)
    #[inline]
    pub fn clear(buf: &mut [f32]) {
        if buf.is_empty() {
            return;
        }
        #[cfg(target_os = "macos")]
        unsafe {
            vDSP_vclr(buf.as_mut_ptr(), 1, buf.len());
        }
        #[cfg(not(target_os = "macos"))]
        buf.fill(0.0);
    }

    /// Get peak (maximum absolute value) of a buffer
    #[inline]
    pub fn peak(buf: &[f32]) -> f32 {
        if buf.is_empty() {
            return 0.0;
        }
        #[cfg(target_os = "macos")]
        {
            let mut peak: f32 = 0.0;
            unsafe {
                vDSP_maxmgv(buf.as_ptr(), 1, &mut peak, buf.len());
            }
            peak
        }
        #[cfg(not(target_os = "macos"))]
        buf.iter().fold(0.0f32, |acc, x| acc.max(x.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_to() {
        let input = vec![1.0_f32; 256];
        let mut output = vec![0.5_f32; 256];
        VDsp::add_to(&input, &mut output);
        assert!((output[0] - 1.5).abs() < 0.001);
        assert!((output[255] - 1.5).abs() < 0.001);
    }

    #[test]
    fn test_clear() {
        let mut buf = vec![0.7_f32; 64];
        VDsp::clear(&mut buf);
        assert!(buf.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_peak_uses_magnitude() {
        let buf = [0.25_f32, -0.9, 0.5];
        assert!((VDsp::peak(&buf) - 0.9).abs() < 0.001);
    }
}
