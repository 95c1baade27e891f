//! Identifier catalogue of the capture pipe.
//!
//! Nodes, buffer types, paths, features, size classes, metadata and
//! request parameters are all bounded enums (see [`crate::id`]). Each path
//! has fixed endpoints; the reverse table from endpoints to path is built
//! at compile time and rejects duplicate endpoint pairs.

use crate::bounded_id;
use crate::id::IdSet;
use std::fmt;

bounded_id! {
    /// A stage of the capture graph.
    pub enum NodeId {
        Root => "root",
        Raw => "raw",
        P2a => "p2a",
        Fd => "fd",
        MultiFrame => "multiframe",
        Yuv => "yuv",
        Mdp => "mdp",
    }
}

bounded_id! {
    /// Semantic kind of an image buffer.
    pub enum TypeId {
        MainFullRaw => "main.full.raw",
        MainRszRaw => "main.rsz.raw",
        MainFullYuv => "main.full.yuv",
        MainRszYuv => "main.rsz.yuv",
        MainCrop1Yuv => "main.crop1.yuv",
        MainCrop2Yuv => "main.crop2.yuv",
        MainLcs => "main.lcs",
        MainFdYuv => "main.fd.yuv",
        MainFd => "main.fd",
        SubFullRaw => "sub.full.raw",
        SubFullYuv => "sub.full.yuv",
        Postview => "postview",
        Jpeg => "jpeg",
        Thumbnail => "thumbnail",
    }
}

bounded_id! {
    /// A directed edge between two nodes.
    ///
    /// `Enque` and `Deque` are virtual: they carry a request into and out
    /// of the root and never take part in traversal accounting.
    pub enum PathId {
        Enque => "enque",
        RootToRaw => "root->raw",
        RootToP2a => "root->p2a",
        RootToMultiFrame => "root->multiframe",
        RawToP2a => "raw->p2a",
        P2aToFd => "p2a->fd",
        P2aToMultiFrame => "p2a->multiframe",
        P2aToYuv => "p2a->yuv",
        P2aToMdp => "p2a->mdp",
        FdToMultiFrame => "fd->multiframe",
        FdToYuv => "fd->yuv",
        MultiFrameToYuv => "multiframe->yuv",
        MultiFrameToMdp => "multiframe->mdp",
        YuvToMdp => "yuv->mdp",
        Deque => "deque",
    }
}

bounded_id! {
    pub enum FeatureId {
        Remosaic => "remosaic",
        Nr => "nr",
        Abf => "abf",
        Hdr => "hdr",
        Mfnr => "mfnr",
        Fb => "fb",
        Dre => "dre",
        Bokeh => "bokeh",
    }
}

bounded_id! {
    /// Size class of a buffer relative to the sensor output.
    pub enum SizeId {
        Full => "full",
        Resized => "resized",
        Binning => "binning",
        Arbitrary => "arbitrary",
        Specific => "specific",
    }
}

bounded_id! {
    pub enum MetadataId {
        MainInP1Dynamic => "main.in.p1dynamic",
        MainInApp => "main.in.app",
        MainInHal => "main.in.hal",
        MainOutApp => "main.out.app",
        MainOutHal => "main.out.hal",
        SubInP1Dynamic => "sub.in.p1dynamic",
        SubInHal => "sub.in.hal",
    }
}

bounded_id! {
    /// Per-request integer parameters.
    pub enum ParamId {
        FrameCount => "frame.count",
        FrameIndex => "frame.index",
        EnableNextCapture => "enable.next.capture",
        RequestPriority => "request.priority",
    }
}

pub type NodeSet = IdSet<NodeId>;
pub type TypeSet = IdSet<TypeId>;
pub type PathSet = IdSet<PathId>;
pub type FeatureSet = IdSet<FeatureId>;
pub type MetadataSet = IdSet<MetadataId>;

impl PathId {
    /// Source and destination node.
    pub const fn endpoints(self) -> (NodeId, NodeId) {
        use NodeId::*;
        match self {
            PathId::Enque | PathId::Deque => (Root, Root),
            PathId::RootToRaw => (Root, Raw),
            PathId::RootToP2a => (Root, P2a),
            PathId::RootToMultiFrame => (Root, MultiFrame),
            PathId::RawToP2a => (Raw, P2a),
            PathId::P2aToFd => (P2a, Fd),
            PathId::P2aToMultiFrame => (P2a, MultiFrame),
            PathId::P2aToYuv => (P2a, Yuv),
            PathId::P2aToMdp => (P2a, Mdp),
            PathId::FdToMultiFrame => (Fd, MultiFrame),
            PathId::FdToYuv => (Fd, Yuv),
            PathId::MultiFrameToYuv => (MultiFrame, Yuv),
            PathId::MultiFrameToMdp => (MultiFrame, Mdp),
            PathId::YuvToMdp => (Yuv, Mdp),
        }
    }

    pub const fn src(self) -> NodeId {
        self.endpoints().0
    }

    pub const fn dst(self) -> NodeId {
        self.endpoints().1
    }

    pub const fn is_virtual(self) -> bool {
        matches!(self, PathId::Enque | PathId::Deque)
    }
}

type PathTable = [[Option<PathId>; NodeId::COUNT]; NodeId::COUNT];

const fn build_path_table() -> PathTable {
    let mut table: PathTable = [[None; NodeId::COUNT]; NodeId::COUNT];
    let mut i = 0;
    while i < PathId::COUNT {
        let path = PathId::ALL[i];
        if !path.is_virtual() {
            let (src, dst) = path.endpoints();
            assert!(
                table[src.index()][dst.index()].is_none(),
                "two paths share the same endpoints"
            );
            table[src.index()][dst.index()] = Some(path);
        }
        i += 1;
    }
    table
}

static PATH_TABLE: PathTable = build_path_table();

/// The path from `src` to `dst`, if the topology has one.
pub fn find_path(src: NodeId, dst: NodeId) -> Option<PathId> {
    PATH_TABLE[src.index()][dst.index()]
}

/// Every non-virtual path.
pub fn real_paths() -> impl Iterator<Item = PathId> {
    PathId::ALL.iter().copied().filter(|p| !p.is_virtual())
}

/// Externally supplied ids occupy `0..EXTERNAL_LIMIT`; ids the pipe assigns
/// for internal buffers occupy `EXTERNAL_LIMIT..INTERNAL_LIMIT`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u8);

impl BufferId {
    pub const EXTERNAL_LIMIT: u8 = 32;
    pub const INTERNAL_LIMIT: u8 = 64;

    pub const fn external(index: u8) -> Option<Self> {
        if index < Self::EXTERNAL_LIMIT {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn internal(index: u8) -> Option<Self> {
        if index < Self::INTERNAL_LIMIT - Self::EXTERNAL_LIMIT {
            Some(Self(Self::EXTERNAL_LIMIT + index))
        } else {
            None
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_internal(self) -> bool {
        self.0 >= Self::EXTERNAL_LIMIT
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_internal() {
            write!(f, "bid:i{}", self.0 - Self::EXTERNAL_LIMIT)
        } else {
            write!(f, "bid:e{}", self.0)
        }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
