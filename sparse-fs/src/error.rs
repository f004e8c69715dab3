#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 空闲扇区耗尽
    OutOfSpace,
    /// 偏移超出索引树可寻址的范围
    OutOfRange,
}
