use sector_dev::SECTOR_SIZE;

use super::{DIRECT_COUNT, ENTRY_SIZE, INDIRECT1_COUNT, INDIRECT2_COUNT, META_SIZE};
use crate::MAGIC;

/// 记录扇区的剩余空间，保留备用
const RESERVED: usize =
    (SECTOR_SIZE - META_SIZE) / ENTRY_SIZE - DIRECT_COUNT - INDIRECT1_COUNT - INDIRECT2_COUNT;

/// 磁盘上的 inode 记录，必须恰好一扇区大
#[repr(C)]
pub struct InodeRecord {
    /// 文件字节长度；u32 是磁盘布局的一部分
    pub(crate) length: u32,
    pub(crate) magic: u32,
    kind: u32,
    /// 直接指针，每项指向一个数据扇区
    pub(crate) direct: [u32; DIRECT_COUNT],
    /// 一级间接指针，每项指向整块都是直接指针的索引扇区
    pub(crate) indirect1: [u32; INDIRECT1_COUNT],
    /// 二级间接指针，再多一层索引
    pub(crate) indirect2: [u32; INDIRECT2_COUNT],
    reserved: [u32; RESERVED],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

const KIND_FILE: u32 = 0;
const KIND_DIR: u32 = 1;

impl InodeRecord {
    /// 初始化为长度已知、尚无任何数据扇区的稀疏文件
    pub(crate) fn init(&mut self, length: u32, kind: InodeKind) {
        self.length = length;
        self.magic = MAGIC;
        self.kind = match kind {
            InodeKind::File => KIND_FILE,
            InodeKind::Directory => KIND_DIR,
        };
        // 所有指针槽填哨兵
        self.direct.fill(u32::MAX);
        self.indirect1.fill(u32::MAX);
        self.indirect2.fill(u32::MAX);
        self.reserved.fill(0);
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    #[inline]
    pub(crate) fn is_dir(&self) -> bool {
        self.kind == KIND_DIR
    }

    #[inline]
    pub(crate) fn set_dir(&mut self, dir: bool) {
        self.kind = if dir { KIND_DIR } else { KIND_FILE };
    }
}
