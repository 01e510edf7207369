use super::Tokenizer;

/// Encodes text as its UTF-8 bytes.
///
/// Prefix-stable: the encoding of a prefix is a prefix of the encoding, so
/// action-mask spans line up exactly with agent content.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }
}
