/// An application message, optionally split into ordered fragments.
///
/// When fragmented, `raw` is always the concatenation of `fragments`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    raw: Vec<u8>,
    fragments: Vec<Vec<u8>>,
}

impl Message {
    /// A message sent as a single reliable packet.
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            raw,
            fragments: Vec::new(),
        }
    }

    /// Splits `raw` into fragments of at most `fragment_size` bytes. Always
    /// yields at least one fragment, so even a tiny message is sent through
    /// the fragmented path.
    pub fn fragmented(raw: Vec<u8>, fragment_size: usize) -> Self {
        let fragment_size = fragment_size.max(1);
        let mut fragments: Vec<Vec<u8>> =
            raw.chunks(fragment_size).map(|chunk| chunk.to_vec()).collect();
        if fragments.is_empty() {
            fragments.push(Vec::new());
        }
        Self { raw, fragments }
    }

    pub fn add_fragment(&mut self, fragment: Vec<u8>) {
        if self.fragments.is_empty() {
            self.raw.clear();
        }
        self.raw.extend_from_slice(&fragment);
        self.fragments.push(fragment);
    }

    pub fn is_fragmented(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn fragments(&self) -> &[Vec<u8>] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
