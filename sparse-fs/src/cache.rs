//! # 扇区缓存层
//!
//! 固定容量的扇区缓冲池，文件系统对设备的一切读写都经过这里。
//! 每个槽位缓存恰好一个扇区的内容，并用自己的监视器管理并发访问：
//! 同一扇区允许多个读者同时进行，写者独占；已登记的待写者
//! 会挡住新来的读者，避免写者饥饿。
//!
//! 成员关系（扇区到槽位的映射、空闲位图、在用队列）由一把协调锁保护；
//! 受害者写回与新扇区载入等设备IO都发生在协调锁之外。
//!
//! 驱逐采用时钟扫描：沿在用队列从时钟指针起依次尝试加锁，
//! 跳过被钉住的槽位，选中第一个无引用的槽位作为受害者。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::hint;
use core::mem;

use spin::Mutex;

use sector_dev::{SectorDevice, SectorId, SECTOR_SIZE};

/// 缓存槽位总数
pub const CACHE_SLOTS: usize = 64;

/// 扇区缓冲；对齐到8字节，槽位上的类型化视图才合法
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// 槽位对外可见的访问模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotMode {
    Idle,
    Reading,
    Writing,
}

/// 槽位元数据，由槽位锁保护
struct SlotState {
    /// 当前占据此槽位的扇区；空表示槽位空闲
    sector: Option<SectorId>,
    /// 内容与磁盘不一致
    dirty: bool,
    /// 在册的读钉数
    readers: u32,
    /// 在册的写钉数，至多为1
    writers: u32,
    /// 已登记、尚未获准的写者数；非零时不再接纳新读者
    pending_writers: u32,
    mode: SlotMode,
}

struct Slot {
    state: Mutex<SlotState>,
    /// 缓存的数据。访问资格完全由状态机授予：
    /// 读钉在册时共享，写钉在册时独占。
    data: UnsafeCell<SectorBuf>,
}

// 数据的并发访问由 `state` 状态机裁决
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                sector: None,
                dirty: false,
                readers: 0,
                writers: 0,
                pending_writers: 0,
                mode: SlotMode::Idle,
            }),
            data: UnsafeCell::new(SectorBuf([0; SECTOR_SIZE])),
        }
    }
}

/// 协调锁保护的成员关系
struct CacheCtl {
    /// 扇区到槽位的映射；一个扇区至多占据一个槽位
    map: BTreeMap<SectorId, usize>,
    /// 空闲位图，置位表示空闲
    free: u64,
    /// 在用队列，插入序，兼作时钟扫描的轨道
    queue: Vec<usize>,
    /// 时钟指针
    hand: usize,
}

impl CacheCtl {
    fn alloc_slot(&mut self) -> Option<usize> {
        let index = self.free.trailing_zeros() as usize;
        (index < CACHE_SLOTS).then(|| {
            self.free &= !(1 << index);
            index
        })
    }

    fn free_slot(&mut self, index: usize) {
        self.free |= 1 << index;
    }
}

pub struct SectorCache {
    dev: Arc<dyn SectorDevice>,
    slots: Box<[Slot]>,
    ctl: Mutex<CacheCtl>,
}

impl SectorCache {
    pub fn new(dev: Arc<dyn SectorDevice>) -> Self {
        Self {
            dev,
            slots: (0..CACHE_SLOTS).map(|_| Slot::new()).collect(),
            ctl: Mutex::new(CacheCtl {
                map: BTreeMap::new(),
                free: u64::MAX >> (64 - CACHE_SLOTS),
                queue: Vec::new(),
                hand: 0,
            }),
        }
    }

    /// 以共享方式钉住 `sector` 的缓冲，首次访问时从设备载入。
    /// 与写者冲突时阻塞等待，从不失败。
    pub fn read(&self, sector: SectorId) -> ReadGuard<'_> {
        let index = self.acquire(sector, false);
        ReadGuard { cache: self, index }
    }

    /// 以独占方式钉住 `sector` 的缓冲。
    /// 先于它的读者、写者全部退场后才会获准。
    pub fn write(&self, sector: SectorId) -> WriteGuard<'_> {
        let index = self.acquire(sector, true);
        WriteGuard { cache: self, index }
    }

    /// 把所有脏槽位写回设备。对每个槽位只做一次非阻塞尝试，
    /// 忙碌的槽位留给下个周期或驱逐时再写。
    pub fn flush_all(&self) {
        let in_use: Vec<usize> = self.ctl.lock().queue.clone();
        let mut flushed = 0usize;

        for index in in_use {
            let Some(mut state) = self.slots[index].state.try_lock() else {
                continue;
            };
            // 持有槽位锁即挡住了新写者；读者可以继续，内容不会变
            if state.writers != 0 || !state.dirty {
                continue;
            }
            let Some(sector) = state.sector else {
                continue;
            };
            self.dev.write_sector(sector, self.bytes(index));
            state.dirty = false;
            flushed += 1;
        }

        if flushed > 0 {
            log::debug!("cache: flushed {flushed} dirty slot(s)");
        }
    }
}

impl SectorCache {
    fn acquire(&self, sector: SectorId, write: bool) -> usize {
        debug_assert!(!sector.is_none());

        loop {
            let index = self.ctl.lock().map.get(&sector).copied();
            let index = match index {
                Some(index) => index,
                None => match self.bind(sector) {
                    Some(index) => index,
                    // 绑定落败于并发者，重新查找
                    None => continue,
                },
            };

            let pinned = if write {
                self.pin_write(index, sector)
            } else {
                self.pin_read(index, sector)
            };
            if pinned {
                return index;
            }
            // 槽位在锁的间隙里被驱逐又另作他用，重新解析
        }
    }

    fn pin_read(&self, index: usize, sector: SectorId) -> bool {
        loop {
            let mut state = self.slots[index].state.lock();
            if state.sector != Some(sector) {
                return false;
            }
            if state.mode != SlotMode::Writing && state.pending_writers == 0 {
                state.readers += 1;
                state.mode = SlotMode::Reading;
                return true;
            }
            drop(state);
            hint::spin_loop();
        }
    }

    fn pin_write(&self, index: usize, sector: SectorId) -> bool {
        {
            let mut state = self.slots[index].state.lock();
            if state.sector != Some(sector) {
                return false;
            }
            // 登记待写者，新读者不得再插队
            state.pending_writers += 1;
        }

        loop {
            let mut state = self.slots[index].state.lock();
            // 有写者登记在册的槽位不会被驱逐，绑定不会再变
            debug_assert_eq!(state.sector, Some(sector));
            if state.mode == SlotMode::Idle {
                debug_assert_eq!((state.readers, state.writers), (0, 0));
                state.pending_writers -= 1;
                state.writers = 1;
                state.mode = SlotMode::Writing;
                return true;
            }
            drop(state);
            hint::spin_loop();
        }
    }

    fn unpin_read(&self, index: usize) {
        let mut state = self.slots[index].state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            state.mode = SlotMode::Idle;
        }
    }

    fn unpin_write(&self, index: usize) {
        let mut state = self.slots[index].state.lock();
        state.writers -= 1;
        // 先置脏再回到空闲：等待者获准时改动必定已完成
        state.dirty = true;
        state.mode = SlotMode::Idle;
    }

    /// 为 `sector` 绑定一个槽位并载入内容。
    /// 返回空表示同扇区已被并发绑定，调用者重新查找即可。
    fn bind(&self, sector: SectorId) -> Option<usize> {
        // 1. 取一个空闲槽位，必要时驱逐恰好一个
        let index = loop {
            if let Some(index) = self.ctl.lock().alloc_slot() {
                break index;
            }
            if !self.evict_one() {
                // 所有槽位都被钉住，等待某个引用退场
                hint::spin_loop();
            }
        };

        // 2. 槽位尚未发布，先以独占方式占住
        {
            let mut state = self.slots[index].state.lock();
            debug_assert!(state.sector.is_none());
            state.sector = Some(sector);
            state.writers = 1;
            state.mode = SlotMode::Writing;
            state.dirty = false;
        }

        // 3. 发布成员关系；落败则撤销占据并退回槽位
        {
            let mut ctl = self.ctl.lock();
            if ctl.map.contains_key(&sector) {
                drop(ctl);
                let mut state = self.slots[index].state.lock();
                state.sector = None;
                state.writers = 0;
                state.mode = SlotMode::Idle;
                drop(state);
                self.ctl.lock().free_slot(index);
                return None;
            }
            ctl.map.insert(sector, index);
            ctl.queue.push(index);
        }

        // 4. 载入内容；此刻独占，同扇区的后来者在槽位上排队
        self.dev.read_sector(sector, self.bytes_mut(index));
        log::trace!("cache: bind {sector:?} -> slot {index}");

        // 5. 解除独占
        let mut state = self.slots[index].state.lock();
        state.writers = 0;
        state.mode = SlotMode::Idle;
        Some(index)
    }

    /// 时钟扫描，驱逐恰好一个无引用槽位。
    /// 全部被钉住时返回 false，由调用者择机重试。
    fn evict_one(&self) -> bool {
        let mut ctl = self.ctl.lock();
        if ctl.queue.is_empty() {
            return false;
        }

        for _ in 0..ctl.queue.len() {
            let pos = ctl.hand % ctl.queue.len();
            let index = ctl.queue[pos];

            let Some(mut state) = self.slots[index].state.try_lock() else {
                ctl.hand = pos + 1;
                continue;
            };
            if state.readers != 0 || state.writers != 0 || state.pending_writers != 0 {
                drop(state);
                ctl.hand = pos + 1;
                continue;
            }

            // 选中受害者。成员关系暂时保留：同扇区的后来者仍能
            // 查到此槽位，在槽位锁上排队，不会抢先去设备上读旧内容
            let sector = state.sector.expect("in-use slot must be bound");
            drop(ctl);

            if state.dirty {
                // 无引用在册且持有槽位锁，内容此刻稳定
                self.dev.write_sector(sector, self.bytes(index));
            }
            log::trace!("cache: evict {sector:?} from slot {index}");

            // 写回落盘之后才摘除成员关系，此后同扇区的重新绑定
            // 从设备读到的必定是写回后的字节
            {
                let mut ctl = self.ctl.lock();
                ctl.map.remove(&sector);
                let pos = ctl
                    .queue
                    .iter()
                    .position(|&queued| queued == index)
                    .expect("victim must stay queued until eviction finishes");
                ctl.queue.remove(pos);
                ctl.hand = pos;
                ctl.free_slot(index);
            }

            self.bytes_mut(index).fill(0);
            state.sector = None;
            state.dirty = false;
            return true;
        }

        false
    }

    // 裸数据访问，调用者必须已按状态机取得相应资格
    fn bytes(&self, index: usize) -> &[u8] {
        unsafe { &(*self.slots[index].data.get()).0 }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, index: usize) -> &mut [u8] {
        unsafe { &mut (*self.slots[index].data.get()).0 }
    }
}

/// 对某扇区缓冲的共享引用；存续期间槽位不会被驱逐或写入
pub struct ReadGuard<'a> {
    cache: &'a SectorCache,
    index: usize,
}

impl ReadGuard<'_> {
    pub fn get<T>(&self, offset: usize) -> &T {
        assert!(mem::size_of::<T>() + offset <= SECTOR_SIZE);
        let addr = &self.cache.bytes(self.index)[offset] as *const u8;
        unsafe { &*addr.cast() }
    }

    #[inline]
    pub fn map<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.cache.bytes(self.index)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin_read(self.index);
    }
}

/// 对某扇区缓冲的独占引用；释放时槽位被标记为脏
pub struct WriteGuard<'a> {
    cache: &'a SectorCache,
    index: usize,
}

impl WriteGuard<'_> {
    pub fn get<T>(&self, offset: usize) -> &T {
        assert!(mem::size_of::<T>() + offset <= SECTOR_SIZE);
        let addr = &self.cache.bytes(self.index)[offset] as *const u8;
        unsafe { &*addr.cast() }
    }

    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        assert!(mem::size_of::<T>() + offset <= SECTOR_SIZE);
        let addr = &mut self.cache.bytes_mut(self.index)[offset] as *mut u8;
        unsafe { &mut *addr.cast() }
    }

    #[inline]
    pub fn map<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.cache.bytes(self.index)
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.cache.bytes_mut(self.index)
    }

    #[inline]
    pub fn fill(&mut self, byte: u8) {
        self.cache.bytes_mut(self.index).fill(byte);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin_write(self.index);
    }
}
