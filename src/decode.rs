//! Per-line text decoding for text-mode capture.

use crate::error::PolicyError;
use crate::policy::DecodeErrors;
use encoding_rs::{DecoderResult, Encoding};

/// A malformed byte sequence at `offset` bytes into the decoded line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Malformed {
    pub offset: usize,
}

/// Decodes one captured line at a time.
///
/// Only ASCII-compatible encodings are accepted: lines are split on byte
/// `0x0A` before decoding, so the newline byte must never occur inside a
/// multi-byte sequence.
#[derive(Debug, Clone, Copy)]
pub struct LineDecoder {
    encoding: &'static Encoding,
    errors: DecodeErrors,
}

impl LineDecoder {
    pub fn for_label(label: &str, errors: DecodeErrors) -> Result<Self, PolicyError> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| PolicyError::UnknownEncoding(label.to_string()))?;
        if !encoding.is_ascii_compatible() {
            return Err(PolicyError::UnsupportedEncoding(label.to_string()));
        }
        Ok(Self { encoding, errors })
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode one line and translate `\r\n` / `\r` line endings to `\n`.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, Malformed> {
        match self.errors {
            DecodeErrors::Replace => Ok(self.decode_lossy(bytes)),
            DecodeErrors::Strict | DecodeErrors::Ignore => {
                Ok(translate_newlines(self.decode_without_replacement(bytes)?))
            }
        }
    }

    /// Decode with U+FFFD substitution, whatever the error policy.
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        let text = self.encoding.decode_without_bom_handling(bytes).0.into_owned();
        translate_newlines(text)
    }

    fn decode_without_replacement(&self, bytes: &[u8]) -> Result<String, Malformed> {
        let mut decoder = self.encoding.new_decoder_without_bom_handling();
        let mut out = String::with_capacity(bytes.len());
        let mut consumed = 0;
        loop {
            let remaining = bytes.len() - consumed;
            out.reserve(
                decoder
                    .max_utf8_buffer_length_without_replacement(remaining)
                    .unwrap_or(remaining * 3 + 4),
            );
            let (result, read) =
                decoder.decode_to_string_without_replacement(&bytes[consumed..], &mut out, true);
            consumed += read;
            match result {
                DecoderResult::InputEmpty => return Ok(out),
                DecoderResult::OutputFull => {}
                DecoderResult::Malformed(bad, extra) => {
                    if self.errors == DecodeErrors::Strict {
                        return Err(Malformed {
                            offset: consumed - bad as usize - extra as usize,
                        });
                    }
                }
            }
        }
    }
}

fn translate_newlines(text: String) -> String {
    if !text.contains('\r') {
        return text;
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
