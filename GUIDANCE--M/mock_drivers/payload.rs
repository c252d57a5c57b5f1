/// Recorded BSM payloads replayed by static vehicles, one per vehicle.
pub const STATIC_BSM_PAYLOADS: [&str; 3] = [
    "00 14 25 03 97 0d 6b 3b 13 39 26 6e 92 6a 1e a6 c1 55 90 00 7f ff 8c cc af ff f0 80 7e fa 1f a1 00 7f ff 08 00 4b 09 b0",
    "00 14 25 03 fa 2f 24 8e 1c 51 a6 6e 8c 2a 1e a6 bd 3b 90 00 7f ff 8c cc af ff f0 80 7e fa 1f a1 00 7f ff 08 00 4b 09 b0",
    "00 14 25 18 ae 7d a9 0e 48 81 e6 6e 95 58 1e a6 cb e1 90 00 7f ff 8c cc af ff f0 80 7e fa 1f a1 00 7f ff 08 00 4b 09 b0",
];

/// Keeps hex digits only; an odd digit count gets a trailing `0`.
///
/// Prefixes such as `0x` are not understood: the `0` survives and the `x` is dropped.
#[must_use]
pub fn sanitize_hex(raw: &str) -> String {
    let mut digits: String = raw.chars().filter(char::is_ascii_hexdigit).collect();
    if digits.len() % 2 != 0 {
        digits.push('0');
    }
    digits
}

/// Decodes a loosely formatted hex string such as `"0a 1f 23"`.
pub fn decode_hex_payload(raw: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(sanitize_hex(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_separators_and_pads_odd_input() {
        assert_eq!(sanitize_hex("0a 1f-23"), "0a1f23");
        assert_eq!(sanitize_hex("a b c"), "abc0");
        assert_eq!(sanitize_hex("0x1F zz 3"), "01F3");
        assert_eq!(sanitize_hex(""), "");
    }

    #[test]
    fn decodes_recorded_bsms() {
        for payload in STATIC_BSM_PAYLOADS {
            let bytes = decode_hex_payload(payload).unwrap();
            assert_eq!(bytes.len(), 40);
            assert_eq!(&bytes[..3], &[0x00, 0x14, 0x25]);
        }
        assert_eq!(decode_hex_payload("a b c").unwrap(), vec![0xab, 0xc0]);
    }
}
