//! qcow2 Image Writer
//!
//! Produces empty, growable qcow2 (version 3) images without `qemu-img`.
//! The file holds only metadata: the header cluster, a one-cluster refcount
//! table, a single refcount block and a zeroed L1 table. No L2 tables are
//! allocated, so every guest read returns zeroes until QEMU writes data.
//!
//! ```text
//! cluster 0          header (104 bytes) + empty extension list
//! cluster 1          refcount table   -> cluster 2
//! cluster 2          refcount block   (u16 refcount per cluster)
//! cluster 3..3+n     L1 table         (all zero)
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `QFI\xfb`
pub const QCOW2_MAGIC: u32 = 0x5146_49fb;

/// Header version written by [`Qcow2Header::for_size`]
pub const QCOW2_VERSION: u32 = 3;

/// 64 KiB clusters
pub const CLUSTER_BITS: u32 = 16;

/// Size of the version 3 header
pub const HEADER_LENGTH: u32 = 104;

/// 16-bit refcount entries (`1 << 4` bits)
const REFCOUNT_ORDER: u32 = 4;

const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;

/// Number of leading metadata clusters before the L1 table
const FIXED_CLUSTERS: u64 = 3;

/// Bytes of guest data mapped by one L2 table (cluster_size / 8 entries)
const BYTES_PER_L2: u64 = CLUSTER_SIZE * (CLUSTER_SIZE / 8);

/// QEMU refuses L1 tables above 32 MiB
pub const MAX_L1_ENTRIES: u64 = (32 << 20) / 8;

/// Largest virtual size an image can have (2 PiB with 64 KiB clusters)
pub const MAX_IMAGE_SIZE: u64 = MAX_L1_ENTRIES * BYTES_PER_L2;

// The single refcount block must cover every metadata cluster.
const _: () = assert!(
    FIXED_CLUSTERS + (MAX_L1_ENTRIES * 8).div_ceil(CLUSTER_SIZE) <= CLUSTER_SIZE / 2
);

// =============================================================================
// Header
// =============================================================================

/// Fields of a qcow2 header relevant to an unallocated image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qcow2Header {
    pub version: u32,
    pub cluster_bits: u32,
    /// Virtual disk size in bytes
    pub size: u64,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
}

impl Qcow2Header {
    /// Header of an empty image with the given virtual size
    pub fn for_size(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("image size must be positive".into()));
        }

        if size > MAX_IMAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "image size {} exceeds the maximum of {} bytes",
                size, MAX_IMAGE_SIZE
            )));
        }
        let l1_size = u32::try_from(size.div_ceil(BYTES_PER_L2)).map_err(|_| {
            Error::InvalidArgument(format!("image size {} is too large", size))
        })?;

        Ok(Self {
            version: QCOW2_VERSION,
            cluster_bits: CLUSTER_BITS,
            size,
            l1_size,
            l1_table_offset: FIXED_CLUSTERS * CLUSTER_SIZE,
            refcount_table_offset: CLUSTER_SIZE,
            refcount_table_clusters: 1,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    /// Clusters occupied by the L1 table (at least one)
    pub fn l1_clusters(&self) -> u64 {
        (u64::from(self.l1_size) * 8).div_ceil(self.cluster_size()).max(1)
    }

    /// Total length of the image file on disk
    pub fn file_len(&self) -> u64 {
        (FIXED_CLUSTERS + self.l1_clusters()) * self.cluster_size()
    }

    /// Encode the 104-byte header
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(QCOW2_MAGIC);
        buf.put_u32(self.version);
        buf.put_u64(0); // backing_file_offset
        buf.put_u32(0); // backing_file_size
        buf.put_u32(self.cluster_bits);
        buf.put_u64(self.size);
        buf.put_u32(0); // crypt_method
        buf.put_u32(self.l1_size);
        buf.put_u64(self.l1_table_offset);
        buf.put_u64(self.refcount_table_offset);
        buf.put_u32(self.refcount_table_clusters);
        buf.put_u32(0); // nb_snapshots
        buf.put_u64(0); // snapshots_offset
        buf.put_u64(0); // incompatible_features
        buf.put_u64(0); // compatible_features
        buf.put_u64(0); // autoclear_features
        buf.put_u32(REFCOUNT_ORDER);
        buf.put_u32(HEADER_LENGTH);
    }

    /// Decode a header, accepting version 2 and 3 images
    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < 72 {
            return Err(Error::Internal("qcow2 header is truncated".into()));
        }

        let magic = buf.get_u32();
        if magic != QCOW2_MAGIC {
            return Err(Error::Internal(format!("bad qcow2 magic {:#010x}", magic)));
        }
        let version = buf.get_u32();
        if version != 2 && version != 3 {
            return Err(Error::Internal(format!(
                "unsupported qcow2 version {}",
                version
            )));
        }

        buf.advance(8 + 4); // backing file
        let cluster_bits = buf.get_u32();
        let size = buf.get_u64();
        buf.advance(4); // crypt_method
        let l1_size = buf.get_u32();
        let l1_table_offset = buf.get_u64();
        let refcount_table_offset = buf.get_u64();
        let refcount_table_clusters = buf.get_u32();

        Ok(Self {
            version,
            cluster_bits,
            size,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
        })
    }

    /// Header, refcount table and refcount block; the L1 table that follows
    /// is all zeroes and is produced by extending the file
    pub fn metadata_prefix(&self) -> Bytes {
        let cluster = self.cluster_size() as usize;
        let mut buf = BytesMut::zeroed(FIXED_CLUSTERS as usize * cluster);

        {
            let mut header = &mut buf[..HEADER_LENGTH as usize];
            self.encode(&mut header);
        }

        {
            let mut table = &mut buf[cluster..cluster + 8];
            table.put_u64(2 * self.cluster_size());
        }

        let used = (FIXED_CLUSTERS + self.l1_clusters()) as usize;
        let block_start = 2 * cluster;
        for index in 0..used {
            let at = block_start + index * 2;
            let mut entry = &mut buf[at..at + 2];
            entry.put_u16(1);
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_header_layout_for_two_gib() {
        let header = Qcow2Header::for_size(2 * GIB).unwrap();
        assert_eq!(header.l1_size, 4);
        assert_eq!(header.l1_clusters(), 1);
        assert_eq!(header.file_len(), 4 * CLUSTER_SIZE);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LENGTH as usize);
        assert_eq!(&buf[..4], b"QFI\xfb");
        assert_eq!(&buf[24..32], &(2 * GIB).to_be_bytes());
    }

    #[test]
    fn test_decode_reads_back_virtual_size() {
        let header = Qcow2Header::for_size(10 * GIB + 512).unwrap();
        let decoded = Qcow2Header::decode(header.metadata_prefix()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.size, 10 * GIB + 512);
    }

    #[test]
    fn test_refcounts_cover_metadata_clusters() {
        let header = Qcow2Header::for_size(GIB).unwrap();
        let prefix = header.metadata_prefix();
        let cluster = CLUSTER_SIZE as usize;

        let mut table = &prefix[cluster..cluster + 8];
        assert_eq!(table.get_u64(), 2 * CLUSTER_SIZE);

        let mut block = &prefix[2 * cluster..2 * cluster + 10];
        let refcounts: Vec<u16> = (0..5).map(|_| block.get_u16()).collect();
        assert_eq!(refcounts, vec![1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_large_l1_spans_clusters() {
        // 8192 L1 entries fill exactly one cluster; one more needs a second.
        let per_cluster = (CLUSTER_SIZE / 8) * CLUSTER_SIZE * (CLUSTER_SIZE / 8);
        let header = Qcow2Header::for_size(per_cluster + 1).unwrap();
        assert_eq!(header.l1_clusters(), 2);
    }

    #[test]
    fn test_size_ceiling() {
        let largest = Qcow2Header::for_size(MAX_IMAGE_SIZE).unwrap();
        assert_eq!(u64::from(largest.l1_size), MAX_L1_ENTRIES);
        assert_eq!(largest.l1_clusters(), 512);

        let prefix = largest.metadata_prefix();
        let at = 2 * CLUSTER_SIZE as usize + (FIXED_CLUSTERS as usize + 511) * 2;
        assert_eq!((&prefix[at..at + 4]).get_u32(), 0x0001_0000);

        assert_matches!(
            Qcow2Header::for_size(MAX_IMAGE_SIZE + 1),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Qcow2Header::for_size(1 << 60),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Qcow2Header::for_size(u64::MAX),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(Qcow2Header::for_size(0).is_err());
        assert!(Qcow2Header::decode(&b"not a qcow2 image at all"[..]).is_err());
        assert!(Qcow2Header::decode(Bytes::from(vec![0u8; 128])).is_err());
    }
}
