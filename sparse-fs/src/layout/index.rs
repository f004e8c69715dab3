//! # 多级索引树
//!
//! 记录内的指针分三档：直接指针指向数据扇区；一级间接指针
//! 指向整块都是直接指针的索引扇区；二级间接指针再多一层。
//! 三档共用同一段下降逻辑：先把字节偏移翻成下降路径，
//! 再沿路径逐层"读指针、按需分配、进入子扇区"。
//!
//! ## 扩展竞争
//!
//! 并发的扩展写者可能抢填同一个空指针槽。分配方先在自己的候选
//! 扇区上完成初始化，再到父扇区的写钉下复核指针：仍为空则挂接，
//! 已被抢先则归还候选、采用胜者。全程不要求跨扇区的树级锁。

use alloc::vec::Vec;

use sector_dev::{SectorId, SECTOR_SIZE};

use super::record::InodeRecord;
use super::{
    IndirectBlock, DIRECT_COUNT, ENTRIES_PER_SECTOR, ENTRY_SIZE, INDIRECT1_COUNT, INDIRECT2_COUNT,
    META_SIZE,
};
use crate::cache::SectorCache;
use crate::space::FreeSpace;
use crate::FsError;

/// 下降一步：在父扇区内偏移 `offset` 处取一个指针
#[derive(Clone, Copy)]
struct Step {
    /// 指针在父扇区内的字节偏移
    offset: usize,
    /// 指针所指是否还是索引扇区
    index_block: bool,
}

/// 记录内第 `slot` 个指针槽的字节偏移
#[inline]
fn record_entry(slot: usize) -> usize {
    META_SIZE + slot * ENTRY_SIZE
}

/// 把文件内的扇区序号翻成下降路径，按三档容量逐档剔除
fn plan(sector_index: usize) -> Result<Vec<Step>, FsError> {
    let mut steps = Vec::with_capacity(3);

    if sector_index < DIRECT_COUNT {
        steps.push(Step {
            offset: record_entry(sector_index),
            index_block: false,
        });
        return Ok(steps);
    }

    // 剔去直接档
    let index = sector_index - DIRECT_COUNT;
    if index < INDIRECT1_COUNT * ENTRIES_PER_SECTOR {
        steps.push(Step {
            offset: record_entry(DIRECT_COUNT + index / ENTRIES_PER_SECTOR),
            index_block: true,
        });
        steps.push(Step {
            offset: index % ENTRIES_PER_SECTOR * ENTRY_SIZE,
            index_block: false,
        });
        return Ok(steps);
    }

    // 剔去一级间接档
    let index = index - INDIRECT1_COUNT * ENTRIES_PER_SECTOR;
    if index < INDIRECT2_COUNT * ENTRIES_PER_SECTOR * ENTRIES_PER_SECTOR {
        steps.push(Step {
            offset: record_entry(
                DIRECT_COUNT + INDIRECT1_COUNT + index / (ENTRIES_PER_SECTOR * ENTRIES_PER_SECTOR),
            ),
            index_block: true,
        });
        steps.push(Step {
            offset: index / ENTRIES_PER_SECTOR % ENTRIES_PER_SECTOR * ENTRY_SIZE,
            index_block: true,
        });
        steps.push(Step {
            offset: index % ENTRIES_PER_SECTOR * ENTRY_SIZE,
            index_block: false,
        });
        return Ok(steps);
    }

    // 超出二级间接档，索引树不支持第四档
    Err(FsError::OutOfRange)
}

/// 把 inode 内的字节偏移解析成数据扇区编号。
///
/// `allocate` 为真时补齐路径上缺失的链接；为假时遇到空指针槽
/// 返回 `None`，调用者按零读出即可，这不是错误。
pub(crate) fn resolve(
    cache: &SectorCache,
    space: &dyn FreeSpace,
    inode_sector: SectorId,
    pos: usize,
    allocate: bool,
) -> Result<Option<SectorId>, FsError> {
    let mut parent = inode_sector;
    for step in plan(pos / SECTOR_SIZE)? {
        match lookup_entry(cache, space, parent, step, allocate)? {
            Some(child) => parent = child,
            None => return Ok(None),
        }
    }
    Ok(Some(parent))
}

/// 读出父扇区内的一个指针，按需分配它所指的扇区
fn lookup_entry(
    cache: &SectorCache,
    space: &dyn FreeSpace,
    parent: SectorId,
    step: Step,
    allocate: bool,
) -> Result<Option<SectorId>, FsError> {
    let entry = SectorId::from(cache.read(parent).map(step.offset, |raw: &u32| *raw));
    if !entry.is_none() {
        return Ok(Some(entry));
    }
    if !allocate {
        return Ok(None);
    }

    // 先在候选扇区上完成初始化再挂接，
    // 其它线程一旦读到指针，所指扇区必定可用
    let candidate = space.allocate(1)?;
    {
        let mut fresh = cache.write(candidate);
        // 索引扇区每项填哨兵（u32::MAX 逐字节即 0xFF），数据扇区清零
        fresh.fill(if step.index_block { 0xFF } else { 0 });
    }

    let winner = {
        let mut guard = cache.write(parent);
        let current = SectorId::from(guard.map(step.offset, |raw: &u32| *raw));
        if current.is_none() {
            guard.map_mut(step.offset, |raw: &mut u32| *raw = candidate.into());
            candidate
        } else {
            // 落败于并发的扩展写者，采用胜者的扇区
            current
        }
    };
    if winner != candidate {
        space.release(candidate, 1);
    }

    Ok(Some(winner))
}

/// 归还索引树占用的所有扇区（不含记录扇区本身）。
///
/// 按已分配指针扫描而不是按 length 截断，
/// 即便 length 因中止的写入而过期也不会漏还扇区。
pub(crate) fn release_tree(cache: &SectorCache, space: &dyn FreeSpace, inode_sector: SectorId) {
    let (direct, indirect1, indirect2) = {
        let guard = cache.read(inode_sector);
        guard.map(0, |record: &InodeRecord| {
            (
                allocated(&record.direct),
                allocated(&record.indirect1),
                allocated(&record.indirect2),
            )
        })
    };

    for leaf in direct {
        space.release(leaf, 1);
    }
    for block in indirect1 {
        release_index_block(cache, space, block);
    }
    for block in indirect2 {
        for inner in entries(cache, block) {
            release_index_block(cache, space, inner);
        }
        space.release(block, 1);
    }
}

/// 归还一个一级索引扇区及其指向的所有数据扇区
fn release_index_block(cache: &SectorCache, space: &dyn FreeSpace, block: SectorId) {
    for leaf in entries(cache, block) {
        space.release(leaf, 1);
    }
    space.release(block, 1);
}

/// 索引扇区内所有非哨兵项
fn entries(cache: &SectorCache, block: SectorId) -> Vec<SectorId> {
    let guard = cache.read(block);
    guard.map(0, |block: &IndirectBlock| allocated(block))
}

fn allocated(entries: &[u32]) -> Vec<SectorId> {
    entries
        .iter()
        .map(|&raw| SectorId::from(raw))
        .filter(|id| !id.is_none())
        .collect()
}
