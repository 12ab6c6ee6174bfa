//! Tiger Tree Hash (THEX) over the `tiger` primitive.
//!
//! Leaves are `Tiger(0x00 || block)` over 1024-byte blocks, internal nodes are
//! `Tiger(0x01 || left || right)`, and a node without a sibling is promoted
//! unchanged. The empty input hashes to the leaf of an empty block.
//!
//! [`TreeHasher`] computes a root while data streams through it, keeping only
//! one partial block and one pending node per tree level. [`TreeVerifier`]
//! checks a transfer against a root and, when the peer supplied them, against
//! the tree's leaf level so a corrupt block is caught as soon as its segment
//! completes.

use std::fmt;
use std::str::FromStr;

use tiger::{Digest, Tiger};

use crate::core::identifier::{decode_base32, encode_base32};
use crate::error::{constants, ProtocolError, Result};

/// Leaf block size in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Tiger digest size in bytes.
pub const DIGEST_SIZE: usize = 24;

/// Length of the base32 text form.
pub const ENCODED_LEN: usize = 39;

type Node = [u8; DIGEST_SIZE];

fn leaf(block: &[u8]) -> Node {
    let mut hasher = Tiger::new();
    hasher.update([0x00]);
    hasher.update(block);
    to_node(&hasher.finalize())
}

fn internal(left: &Node, right: &Node) -> Node {
    let mut hasher = Tiger::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    to_node(&hasher.finalize())
}

fn to_node(digest: &[u8]) -> Node {
    let mut node = [0u8; DIGEST_SIZE];
    node.copy_from_slice(&digest[..DIGEST_SIZE]);
    node
}

/// Root of a tree whose bottom level is `nodes`.
fn fold_level(nodes: &[Node]) -> Option<Node> {
    let mut level = nodes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => internal(left, right),
                _ => pair[0],
            })
            .collect();
    }
    level.first().copied()
}

/// A Tiger Tree Hash root.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TigerTreeHash([u8; DIGEST_SIZE]);

impl TigerTreeHash {
    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Root of `data` in one call.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = TreeHasher::new();
        hasher.write(data);
        hasher.sum()
    }
}

impl FromStr for TigerTreeHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ENCODED_LEN {
            return Err(ProtocolError::MalformedIdentifier(format!(
                "{}: {s:?}",
                constants::ERR_INVALID_TTH
            )));
        }
        let raw = decode_base32(s)?;
        let bytes: [u8; DIGEST_SIZE] = raw.try_into().map_err(|_| {
            ProtocolError::MalformedIdentifier(constants::ERR_INVALID_TTH.into())
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for TigerTreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_base32(&self.0))
    }
}

impl fmt::Debug for TigerTreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TTH/{self}")
    }
}

/// Streaming tree hasher.
#[derive(Clone, Default)]
pub struct TreeHasher {
    block: Vec<u8>,
    // (level, node) pairs with strictly decreasing levels.
    stack: Vec<(u32, Node)>,
    blocks: u64,
    len: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            block: Vec::with_capacity(BLOCK_SIZE),
            ..Self::default()
        }
    }

    pub fn write(&mut self, mut data: &[u8]) {
        self.len += data.len() as u64;
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block.len()).min(data.len());
            self.block.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.block.len() == BLOCK_SIZE {
                self.push_block();
            }
        }
    }

    fn push_block(&mut self) {
        let mut node = leaf(&self.block);
        self.block.clear();
        self.blocks += 1;

        let mut level = 0;
        while let Some(&(top_level, top)) = self.stack.last() {
            if top_level != level {
                break;
            }
            self.stack.pop();
            node = internal(&top, &node);
            level += 1;
        }
        self.stack.push((level, node));
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root over everything written so far.
    pub fn sum(&self) -> TigerTreeHash {
        let mut stack = self.stack.clone();
        if !self.block.is_empty() || self.blocks == 0 {
            stack.push((0, leaf(&self.block)));
        }

        let mut root = match stack.pop() {
            Some((_, node)) => node,
            None => leaf(&[]),
        };
        while let Some((_, left)) = stack.pop() {
            root = internal(&left, &root);
        }
        TigerTreeHash(root)
    }
}

/// Parse a `tthl` body: concatenated 24-byte nodes.
pub fn parse_leaves(body: &[u8]) -> Result<Vec<TigerTreeHash>> {
    if body.is_empty() || body.len() % DIGEST_SIZE != 0 {
        return Err(ProtocolError::VerificationFailure(format!(
            "leaf data of {} bytes is not a whole number of digests",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(DIGEST_SIZE)
        .map(|c| TigerTreeHash(to_node(c)))
        .collect())
}

/// Smallest power-of-two multiple of [`BLOCK_SIZE`] that splits `file_size`
/// into exactly `leaves` segments.
fn segment_size(file_size: u64, leaves: usize) -> Option<u64> {
    let mut segment = BLOCK_SIZE as u64;
    loop {
        let count = file_size.div_ceil(segment).max(1);
        if count == leaves as u64 {
            return Some(segment);
        }
        if count < leaves as u64 {
            return None;
        }
        segment = segment.checked_mul(2)?;
    }
}

/// Checks a streamed transfer against an expected root.
pub struct TreeVerifier {
    root: TigerTreeHash,
    leaves: Vec<Node>,
    segment_size: u64,
    segment: TreeHasher,
    segment_index: usize,
    whole: TreeHasher,
}

impl TreeVerifier {
    /// Root-only verification, decided when the transfer ends.
    pub fn root_only(root: TigerTreeHash) -> Self {
        Self {
            root,
            leaves: Vec::new(),
            segment_size: u64::MAX,
            segment: TreeHasher::new(),
            segment_index: 0,
            whole: TreeHasher::new(),
        }
    }

    /// Verification against a leaf level as well.
    ///
    /// Fails if the leaves do not fold to `root` or do not fit `file_size`.
    pub fn with_leaves(root: TigerTreeHash, leaves: &[TigerTreeHash], file_size: u64) -> Result<Self> {
        let nodes: Vec<Node> = leaves.iter().map(|l| l.0).collect();
        if fold_level(&nodes) != Some(root.0) {
            return Err(ProtocolError::VerificationFailure(format!(
                "leaves do not match root {root}"
            )));
        }
        let segment_size = segment_size(file_size, nodes.len()).ok_or_else(|| {
            ProtocolError::VerificationFailure(format!(
                "{} leaves do not fit a file of {file_size} bytes",
                nodes.len()
            ))
        })?;
        Ok(Self {
            root,
            leaves: nodes,
            segment_size,
            segment: TreeHasher::new(),
            segment_index: 0,
            whole: TreeHasher::new(),
        })
    }

    pub fn root(&self) -> TigerTreeHash {
        self.root
    }

    /// Feed the next piece of the transfer. Fails as soon as a completed
    /// segment does not match its leaf.
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        self.whole.write(data);
        if self.leaves.is_empty() {
            return Ok(());
        }
        while !data.is_empty() {
            let room = self.segment_size - self.segment.len();
            let take = usize::try_from(room).unwrap_or(usize::MAX).min(data.len());
            self.segment.write(&data[..take]);
            data = &data[take..];
            if self.segment.len() == self.segment_size {
                self.close_segment()?;
            }
        }
        Ok(())
    }

    fn close_segment(&mut self) -> Result<()> {
        let actual = self.segment.sum();
        let expected = self.leaves.get(self.segment_index).ok_or_else(|| {
            ProtocolError::VerificationFailure("more data than the leaves describe".into())
        })?;
        if actual.0 != *expected {
            return Err(ProtocolError::VerificationFailure(format!(
                "segment {} at offset {} does not match its leaf",
                self.segment_index,
                self.segment_index as u64 * self.segment_size
            )));
        }
        self.segment = TreeHasher::new();
        self.segment_index += 1;
        Ok(())
    }

    /// Bytes seen so far.
    pub fn len(&self) -> u64 {
        self.whole.len()
    }

    pub fn is_empty(&self) -> bool {
        self.whole.is_empty()
    }

    /// Final check once the transfer has ended.
    pub fn finish(mut self) -> Result<TigerTreeHash> {
        if !self.leaves.is_empty() && !self.segment.is_empty() {
            self.close_segment()?;
        }
        let actual = self.whole.sum();
        if actual != self.root {
            return Err(ProtocolError::VerificationFailure(format!(
                "expected {}, got {actual}",
                self.root
            )));
        }
        Ok(actual)
    }
}
