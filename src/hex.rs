use std::fmt::Write;

/// Render `data` with 16 bytes per line, like `xxd`:
///
/// ```text
/// 00000000: 7f 45 4c 46 02 01 01 00 00 00 00 00 00 00 00 00 .ELF............
/// ```
pub fn hexdump(data: impl AsRef<[u8]>) -> String {
    let data = data.as_ref();
    let mut output = String::with_capacity(data.len() * 4 + data.len() / 16 * 12);

    for (n, chunk) in data.chunks(16).enumerate() {
        if n > 0 {
            output.push('\n');
        }

        let mut hex = String::with_capacity(47);
        for (i, byte) in chunk.iter().enumerate() {
            if i > 0 {
                hex.push(' ');
            }
            let _ = write!(&mut hex, "{byte:02x}");
        }

        let text: String = chunk
            .iter()
            .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
            .collect();

        let _ = write!(&mut output, "{:08x}: {hex:<47} {text}", n * 16);
    }

    output
}

#[test]
fn dump_bytes() {
    assert_eq!(hexdump(b""), "");

    assert_eq!(
        hexdump(b"\x7fELF\x02\x01"),
        "00000000: 7f 45 4c 46 02 01                               .ELF.."
    );

    let data: Vec<u8> = (0x41..0x41 + 17).collect();
    assert_eq!(
        hexdump(&data),
        "00000000: 41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f 50 ABCDEFGHIJKLMNOP\n\
         00000010: 51                                              Q"
    );
}
