/// CSIRO85: a base-85 codec whose alphabet starts at `!` (0x21)
///
/// Every 4 binary bytes become 5 symbols in `[0x21, 0x75]`, so the output is
/// printable ASCII with no NUL or control bytes. Mobile BLE stacks treat the
/// advertised local name as a UTF-8 string, which is why this exists.

use thiserror::Error;

/// Number of symbols in the alphabet
pub const CSIRO85_BASE: u32 = 85;
/// First symbol of the alphabet
pub const CSIRO85_OFFSET: u8 = b'!';
/// Last symbol of the alphabet
pub const CSIRO85_MAX_SYMBOL: u8 = CSIRO85_OFFSET + (CSIRO85_BASE as u8) - 1;

const BINARY_CHUNK: usize = 4;
const ENCODED_CHUNK: usize = 5;

/// Positional weights of the five symbols in a chunk, most significant first
const WEIGHTS: [u32; ENCODED_CHUNK] = [52_200_625, 614_125, 7_225, 85, 1];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Csiro85Error {
    #[error("Input length {len} is not a multiple of {chunk}")]
    UnalignedInput { len: usize, chunk: usize },
    #[error("Output buffer too small: need {need} bytes, got {got}")]
    OutputTooSmall { need: usize, got: usize },
}

/// Encoded length for `binary_len` input bytes
pub fn encoded_len(binary_len: usize) -> usize {
    binary_len / BINARY_CHUNK * ENCODED_CHUNK
}

/// Decoded length for `encoded_len` input symbols
pub fn decoded_len(encoded_len: usize) -> usize {
    encoded_len / ENCODED_CHUNK * BINARY_CHUNK
}

/// Encode `binary` into a freshly allocated buffer
pub fn encode(binary: &[u8]) -> Result<Vec<u8>, Csiro85Error> {
    let mut out = vec![0u8; encoded_len(binary.len())];
    encode_into(binary, &mut out)?;
    Ok(out)
}

/// Encode `binary` into the front of `out`, returning the number of symbols written
pub fn encode_into(binary: &[u8], out: &mut [u8]) -> Result<usize, Csiro85Error> {
    check_lengths(binary.len(), BINARY_CHUNK, encoded_len(binary.len()), out.len())?;
    for (chunk, symbols) in binary
        .chunks_exact(BINARY_CHUNK)
        .zip(out.chunks_exact_mut(ENCODED_CHUNK))
    {
        let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        symbols.copy_from_slice(&encode_chunk(value));
    }
    Ok(encoded_len(binary.len()))
}

/// Encode the first `binary_len` bytes of `buf` in place.
///
/// Chunks are processed from the end of the input backwards, so every chunk
/// is read before the wider output can overwrite it.
pub fn encode_in_place(buf: &mut [u8], binary_len: usize) -> Result<usize, Csiro85Error> {
    let out_len = encoded_len(binary_len);
    check_lengths(binary_len, BINARY_CHUNK, out_len, buf.len())?;
    for chunk_index in (0..binary_len / BINARY_CHUNK).rev() {
        let input = chunk_index * BINARY_CHUNK;
        let value = u32::from_be_bytes([buf[input], buf[input + 1], buf[input + 2], buf[input + 3]]);
        let output = chunk_index * ENCODED_CHUNK;
        buf[output..output + ENCODED_CHUNK].copy_from_slice(&encode_chunk(value));
    }
    Ok(out_len)
}

/// Decode `encoded` into a freshly allocated buffer
pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, Csiro85Error> {
    let mut out = vec![0u8; decoded_len(encoded.len())];
    decode_into(encoded, &mut out)?;
    Ok(out)
}

/// Decode `encoded` into the front of `out`, returning the number of bytes written
pub fn decode_into(encoded: &[u8], out: &mut [u8]) -> Result<usize, Csiro85Error> {
    check_lengths(encoded.len(), ENCODED_CHUNK, decoded_len(encoded.len()), out.len())?;
    for (symbols, chunk) in encoded
        .chunks_exact(ENCODED_CHUNK)
        .zip(out.chunks_exact_mut(BINARY_CHUNK))
    {
        chunk.copy_from_slice(&decode_chunk(symbols).to_be_bytes());
    }
    Ok(decoded_len(encoded.len()))
}

/// Decode the first `encoded_len` symbols of `buf` in place, front to back
pub fn decode_in_place(buf: &mut [u8], encoded_len: usize) -> Result<usize, Csiro85Error> {
    let out_len = decoded_len(encoded_len);
    check_lengths(encoded_len, ENCODED_CHUNK, out_len, buf.len())?;
    for chunk_index in 0..encoded_len / ENCODED_CHUNK {
        let input = chunk_index * ENCODED_CHUNK;
        let value = decode_chunk(&buf[input..input + ENCODED_CHUNK]);
        let output = chunk_index * BINARY_CHUNK;
        buf[output..output + BINARY_CHUNK].copy_from_slice(&value.to_be_bytes());
    }
    Ok(out_len)
}

/// True when every byte lies inside the alphabet
pub fn is_valid(encoded: &[u8]) -> bool {
    encoded
        .iter()
        .all(|b| (CSIRO85_OFFSET..=CSIRO85_MAX_SYMBOL).contains(b))
}

fn encode_chunk(mut value: u32) -> [u8; ENCODED_CHUNK] {
    let mut symbols = [0u8; ENCODED_CHUNK];
    for symbol in symbols.iter_mut().rev() {
        *symbol = (value % CSIRO85_BASE) as u8 + CSIRO85_OFFSET;
        value /= CSIRO85_BASE;
    }
    symbols
}

// Symbols outside the alphabet or chunks above u32::MAX wrap, matching the
// deployed decoder. Callers reject untrusted input with `is_valid` first.
fn decode_chunk(symbols: &[u8]) -> u32 {
    symbols.iter().zip(WEIGHTS).fold(0u32, |acc, (symbol, weight)| {
        let digit = symbol.wrapping_sub(CSIRO85_OFFSET) as u32;
        acc.wrapping_add(digit.wrapping_mul(weight))
    })
}

fn check_lengths(
    input_len: usize,
    chunk: usize,
    need: usize,
    got: usize,
) -> Result<(), Csiro85Error> {
    if input_len % chunk != 0 {
        return Err(Csiro85Error::UnalignedInput { len: input_len, chunk });
    }
    if need > got {
        return Err(Csiro85Error::OutputTooSmall { need, got });
    }
    Ok(())
}
