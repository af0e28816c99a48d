// Copyright © 2020 the courier developers
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The deterministic salt mixer used to answer a connection challenge.

/// Mixes the two connection salts into the expected challenge answer.
///
/// Both sides must call this with the initiator's salt first and the acceptor's salt second;
/// the mix is order-sensitive. The finalizer is the splitmix64 avalanche, so the answer never
/// leaks either salt directly.
pub fn compute(client_salt: u64, server_salt: u64) -> u64 {
    let mut z = client_salt ^ server_salt.rotate_left(27) ^ 0x9e37_79b9_7f4a_7c15;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compute_deterministic() {
        assert_eq!(
            compute(0xDEAD_BEEF_CAFE_F00D, 0x0123_4567_89AB_CDEF),
            compute(0xDEAD_BEEF_CAFE_F00D, 0x0123_4567_89AB_CDEF)
        );
    }

    #[test]
    fn test_compute_order_sensitive() {
        assert_ne!(compute(1, 2), compute(2, 1));
    }

    #[test]
    fn test_compute_differs_from_inputs() {
        let answer = compute(0xAAAA, 0xBBBB);
        assert_ne!(answer, 0xAAAA);
        assert_ne!(answer, 0xBBBB);
        assert_ne!(answer, 0xAAAA ^ 0xBBBB);
    }
}
