//! Stateful NETASCII transducer: reads a byte source and produces chunks of
//! up to `BLOCK_SIZE` bytes, expanding `\n` -> `\r\n` and `\r` -> `\r\0`.
//!
//! A single input byte can expand to two output bytes, so a chunk boundary
//! may fall between the pair. The one-byte carry is modeled as an `Option`
//! on the translator rather than a sentinel value on a byte field.

use std::io::{self, Read};

use super::consts::BLOCK_SIZE;

#[derive(Default)]
pub struct NetasciiTranslator {
    carry: Option<u8>,
}

impl NetasciiTranslator {
    pub fn new() -> Self {
        Self { carry: None }
    }

    /// Fill `out` (length `BLOCK_SIZE`) from `src`, returning the number of
    /// bytes written. A return value `< BLOCK_SIZE` means end of file was
    /// reached while filling this chunk (the terminal chunk, possibly 0).
    pub fn fill_chunk(&mut self, src: &mut impl Read, out: &mut [u8; BLOCK_SIZE]) -> io::Result<usize> {
        let mut n = 0;

        if let Some(carried) = self.carry.take() {
            out[n] = carried;
            n += 1;
        }

        let mut byte = [0u8; 1];
        while n < BLOCK_SIZE {
            match src.read(&mut byte)? {
                0 => break,
                _ => {}
            }

            match byte[0] {
                b'\n' => {
                    out[n] = b'\r';
                    n += 1;
                    if n == BLOCK_SIZE {
                        self.carry = Some(b'\n');
                    } else {
                        out[n] = b'\n';
                        n += 1;
                    }
                }
                b'\r' => {
                    out[n] = b'\r';
                    n += 1;
                    if n == BLOCK_SIZE {
                        self.carry = Some(0);
                    } else {
                        out[n] = 0;
                        n += 1;
                    }
                }
                other => {
                    out[n] = other;
                    n += 1;
                }
            }
        }

        Ok(n)
    }
}
