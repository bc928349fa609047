//! Firmware Object Contract
//!
//! Every structure discovered inside a firmware image is a tree node implementing
//! [`FirmwareObject`]: parse children with `process`, reserialize with `build`, describe
//! with `show`/`info`, and write to disk with `dump`. Children are produced and re-emitted
//! in file order; iteration is depth-first, children before siblings.
//!
//! [`ParseContext`] carries the two pieces of ambient parse state: the remaining recursion
//! budget (compressed-within-guid-defined-within-compressed nesting is bounded rather than
//! allowed to overflow the stack) and the injected [`CompressionCodecs`] capability.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::codec::{CompressionCodecs, StandardCodecs};
use crate::guid::guid_string;

/// Default bound on section nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Ambient parse state handed down the tree.
#[derive(Clone)]
pub struct ParseContext {
    depth: usize,
    codecs: Arc<dyn CompressionCodecs>,
}

impl ParseContext {
    /// Context with the default depth bound and the given codec set.
    pub fn new(codecs: Arc<dyn CompressionCodecs>) -> ParseContext {
        ParseContext { depth: DEFAULT_MAX_DEPTH, codecs }
    }

    /// Context with a caller-chosen depth bound.
    pub fn with_max_depth(codecs: Arc<dyn CompressionCodecs>, max_depth: usize) -> ParseContext {
        ParseContext { depth: max_depth, codecs }
    }

    pub fn codecs(&self) -> &dyn CompressionCodecs {
        self.codecs.as_ref()
    }

    pub fn codecs_arc(&self) -> Arc<dyn CompressionCodecs> {
        self.codecs.clone()
    }

    /// Context for one nesting level down, or `None` once the budget is spent
    /// (`DepthExceeded`: fatal for the subtree, recorded by the parent).
    pub fn descend(&self) -> Option<ParseContext> {
        if self.depth == 0 {
            return None;
        }
        Some(ParseContext { depth: self.depth - 1, codecs: self.codecs.clone() })
    }

    pub fn remaining_depth(&self) -> usize {
        self.depth
    }
}

impl Default for ParseContext {
    fn default() -> ParseContext {
        ParseContext::new(Arc::new(StandardCodecs))
    }
}

/// Metadata bundle for one node, detached from the tree.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeInfo {
    pub label: String,
    pub guid: String,
    pub type_name: String,
    #[cfg_attr(feature = "serde", serde(serialize_with = "crate::serializable::hex_format::serialize"))]
    pub size: usize,
    pub attrs: Vec<(String, String)>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub content: Option<Vec<u8>>,
    pub children: Vec<NodeInfo>,
}

/// A flattened node with a weak back-reference (index) to its parent.
#[derive(Debug, Clone)]
pub struct FlatNode {
    pub info: NodeInfo,
    pub parent: Option<usize>,
}

/// The uniform contract implemented by every parsed firmware structure.
pub trait FirmwareObject: Send + Sync {
    /// Parse children out of the held bytes. Returns overall success; failures below this
    /// node are AND-ed in, and the partially-built tree is retained either way.
    fn process(&mut self, ctx: &ParseContext) -> bool;

    /// Reserialize this node and its descendants. The result always has the length of the
    /// source slice for an unmodified tree; checksum fields are copied verbatim regardless
    /// of `generate_checksum` (bit-exact regeneration is an open problem).
    fn build(&self, generate_checksum: bool) -> Vec<u8>;

    /// Number of input bytes this node covers.
    fn byte_len(&self) -> usize;

    fn type_name(&self) -> &'static str;

    /// Child objects in file order.
    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        Vec::new()
    }

    /// Decoded display name (UI/version sections, volume names), if any.
    fn label(&self) -> String {
        String::new()
    }

    /// On-disk GUID bytes, if this node carries one.
    fn guid(&self) -> Option<[u8; 16]> {
        None
    }

    /// Free-form display metadata.
    fn attrs(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// The owned byte range this node covers.
    fn content(&self) -> &[u8];

    /// Emit one human-readable tree line (and recurse) onto `out`.
    fn show(&self, out: &mut dyn Write, indent: usize, index: Option<usize>) -> io::Result<()>;

    /// Write this node and its descendants below `dir`. Path failures are logged per path
    /// and do not stop sibling output.
    fn dump(&self, dir: &Path, index: usize);

    /// Detached metadata for this node and its descendants.
    fn info(&self, include_content: bool) -> NodeInfo {
        NodeInfo {
            label: self.label(),
            guid: self.guid().map(|g| guid_string(&g)).unwrap_or_default(),
            type_name: self.type_name().to_string(),
            size: self.byte_len(),
            attrs: self.attrs().into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            content: if include_content { Some(self.content().to_vec()) } else { None },
            children: self.objects().into_iter().map(|child| child.info(include_content)).collect(),
        }
    }
}

/// Depth-first metadata for the children of `object`.
pub fn iterate(object: &dyn FirmwareObject, include_content: bool) -> Vec<NodeInfo> {
    object.objects().into_iter().map(|child| child.info(include_content)).collect()
}

/// Collapse nested [`NodeInfo`] lists into a flat vector. Every entry keeps an index
/// back-reference to its parent entry so external tools can locate a node's container.
pub fn flatten(nodes: &[NodeInfo]) -> Vec<FlatNode> {
    fn walk(node: &NodeInfo, parent: Option<usize>, out: &mut Vec<FlatNode>) {
        let index = out.len();
        let mut info = node.clone();
        let children = std::mem::take(&mut info.children);
        out.push(FlatNode { info, parent });
        for child in &children {
            walk(child, Some(index), out);
        }
    }

    let mut out = Vec::new();
    for node in nodes {
        walk(node, None, &mut out);
    }
    out
}

/// Render the full tree rooted at `object` to a string.
pub fn show_tree(object: &dyn FirmwareObject) -> String {
    let mut out = Vec::new();
    // writes to a Vec cannot fail
    object.show(&mut out, 0, None).expect("write to Vec");
    String::from_utf8_lossy(&out).into_owned()
}

/// Indentation prefix for `show` output.
pub(crate) fn ts(indent: usize) -> String {
    "  ".repeat(indent)
}

/// Create parent directories and write `data` to `path`. Returns false (after logging) on
/// failure so dump walks continue with the next sibling.
pub(crate) fn write_file(path: &Path, data: &[u8]) -> bool {
    let result = (|| -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    })();
    match result {
        Ok(()) => {
            log::debug!("wrote: {}", path.display());
            true
        }
        Err(err) => {
            log::error!("could not write {}: {err}", path.display());
            false
        }
    }
}

/// Opaque bytes; the universal fallback child.
#[derive(Debug, Clone)]
pub struct RawObject {
    data: Vec<u8>,
}

impl RawObject {
    pub fn new(data: impl Into<Vec<u8>>) -> RawObject {
        RawObject { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl FirmwareObject for RawObject {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "RawObject"
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(out, "{}RawObject: size= {}", ts(indent), self.data.len())
    }

    fn dump(&self, dir: &Path, index: usize) {
        write_file(&dir.join(format!("object{index}.raw")), &self.data);
    }
}
