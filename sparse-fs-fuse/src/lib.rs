#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sector_dev::{SectorDevice, SectorId, SECTOR_SIZE};
use sparse_fs::{FsError, FreeSpace, SectorCache};

/// 文件充当扇区设备
pub struct SectorFile(pub Mutex<File>);

impl SectorDevice for SectorFile {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((usize::from(sector) * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(
            file.read(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }

    fn write_sector(&self, sector: SectorId, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((usize::from(sector) * SECTOR_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }
}

/// 内存扇区设备，附带IO计数，测试用
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(total: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0; total * SECTOR_SIZE]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 越过缓存直接看设备上的扇区内容
    pub fn sector_bytes(&self, sector: SectorId) -> Vec<u8> {
        let base = usize::from(sector) * SECTOR_SIZE;
        self.sectors.lock().unwrap()[base..base + SECTOR_SIZE].to_vec()
    }
}

impl SectorDevice for MemDisk {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) {
        let base = usize::from(sector) * SECTOR_SIZE;
        buf.copy_from_slice(&self.sectors.lock().unwrap()[base..base + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: SectorId, buf: &[u8]) {
        let base = usize::from(sector) * SECTOR_SIZE;
        self.sectors.lock().unwrap()[base..base + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// 位图空闲扇区分配器，附带在用计数，核心层把它当外部服务消费
pub struct BitmapSpace {
    words: Mutex<Vec<u64>>,
    total: usize,
    in_use: AtomicUsize,
}

impl BitmapSpace {
    /// 管理编号 `[0, total)` 的扇区，前 `reserved` 个预先标记在用
    pub fn new(total: usize, reserved: usize) -> Self {
        assert!(reserved <= total);
        let mut words = vec![0u64; total.div_ceil(64)];
        for bit in 0..reserved {
            words[bit / 64] |= 1 << (bit % 64);
        }
        // 词尾越界的位也标记在用，扫描时不会分配到不存在的扇区
        for bit in total..words.len() * 64 {
            words[bit / 64] |= 1 << (bit % 64);
        }

        Self {
            words: Mutex::new(words),
            total,
            in_use: AtomicUsize::new(reserved),
        }
    }

    /// 当前在用的扇区数（含预留扇区）
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl FreeSpace for BitmapSpace {
    fn allocate(&self, count: usize) -> Result<SectorId, FsError> {
        let mut words = self.words.lock().unwrap();

        // 单扇区请求走字级扫描
        if count == 1 {
            if let Some((index, bit)) = words
                .iter()
                .enumerate()
                .find_map(|(index, &word)| (word != u64::MAX).then(|| (index, word.trailing_ones())))
            {
                words[index] |= 1 << bit;
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(SectorId::new((index * 64) as u32 + bit));
            }
            return Err(FsError::OutOfSpace);
        }

        // 连续段请求逐位扫描
        let mut run = 0;
        let mut start = 0;
        for bit in 0..self.total {
            if words[bit / 64] >> (bit % 64) & 1 == 0 {
                if run == 0 {
                    start = bit;
                }
                run += 1;
                if run == count {
                    for taken in start..start + count {
                        words[taken / 64] |= 1 << (taken % 64);
                    }
                    self.in_use.fetch_add(count, Ordering::Relaxed);
                    return Ok(SectorId::new(start as u32));
                }
            } else {
                run = 0;
            }
        }
        Err(FsError::OutOfSpace)
    }

    fn release(&self, start: SectorId, count: usize) {
        let mut words = self.words.lock().unwrap();
        let base: usize = start.into();
        for bit in base..base + count {
            // 归还的扇区必定在用
            assert_ne!(words[bit / 64] & (1 << (bit % 64)), 0);
            words[bit / 64] &= !(1 << (bit % 64));
        }
        self.in_use.fetch_sub(count, Ordering::Relaxed);
    }
}

/// 后台冲刷任务：按固定周期把脏扇区写回设备。
/// 只作持久化上的保障，不提供事务语义。
pub struct Flusher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Flusher {
    pub fn spawn(cache: Arc<SectorCache>, period: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    cache.flush_all();
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
