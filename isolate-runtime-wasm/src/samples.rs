//! Ready-made binaries for smoke tests and transport exercises.

/// `(module (func (export "main") (result i32) (i32.const 42)))`
pub const RETURN_42: [u8; 37] = [
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // magic, version
    0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type: () -> i32
    0x03, 0x02, 0x01, 0x00, // function 0 has type 0
    0x07, 0x08, 0x01, 0x04, 0x6d, 0x61, 0x69, 0x6e, 0x00, 0x00, // export "main"
    0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b, // body: i32.const 42
];

pub fn return_42() -> Vec<u8> {
    RETURN_42.to_vec()
}

/// [`RETURN_42`] followed by a `padding` custom section of `padding_bytes`
/// zeros. Large enough paddings push a binary past the inline-transport
/// threshold without changing what it does.
pub fn padded(padding_bytes: usize) -> Vec<u8> {
    const NAME: &[u8] = b"padding";

    let mut payload = encode_unsigned_leb128(NAME.len() as u64);
    payload.extend_from_slice(NAME);
    payload.resize(payload.len() + padding_bytes, 0);

    let mut module = return_42();
    module.push(0x00);
    module.extend(encode_unsigned_leb128(payload.len() as u64));
    module.extend(payload);
    module
}

pub fn encode_unsigned_leb128(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}
