// crates/cv_engine/src/layout.rs

//! 系数布局
//!
//! 场的系数按模式组 `(m, ℓ)` 分块连续存放；块内按列（分量）再按径向阶数排列：
//!
//! ```text
//! [ block(m0,ℓ0): col0[n=0..N0) col1[n=0..N1) ... | block(m0,ℓ1): ... ]
//! ```
//!
//! 球面、球壳、圆周上一列对应一个自旋分量；球体上一列对应正则性分解中的一个
//! 正则分量，其自旋分量组合由 `spins` 给出（即 `Q` 的一列）。

use cv_foundation::{CvError, CvResult, ModeKey};
use cv_spectral::tensor::TensorSig;
use num_complex::Complex64;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// 块内的一列
#[derive(Debug, Clone)]
pub struct Column {
    /// (自旋分量, 系数)
    pub spins: SmallVec<[(usize, Complex64); 4]>,
    /// 径向指数（球体为 `ℓ + b`，其他几何为 0）
    pub lambda: u32,
    /// 径向系数个数
    pub count: usize,
    /// 块内偏移
    pub offset: usize,
}

/// 单个模式组的系数布局
#[derive(Debug, Clone)]
pub struct BlockLayout {
    /// 模式键
    pub key: ModeKey,
    /// 张量形状
    pub sig: TensorSig,
    /// 列
    pub columns: Vec<Column>,
    /// 块大小
    pub size: usize,
}

impl BlockLayout {
    /// 由列构造（自动计算偏移）
    pub fn new(key: ModeKey, sig: TensorSig, mut columns: Vec<Column>) -> Self {
        let mut offset = 0;
        for col in &mut columns {
            col.offset = offset;
            offset += col.count;
        }
        Self {
            key,
            sig,
            columns,
            size: offset,
        }
    }

    /// 是否为空块
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// 场的完整系数布局
#[derive(Debug, Clone)]
pub struct FieldLayout {
    /// 张量形状
    pub sig: TensorSig,
    /// 是否含角向依赖
    pub angular: bool,
    blocks: Vec<Arc<BlockLayout>>,
    offsets: Vec<usize>,
    index: HashMap<ModeKey, usize>,
    size: usize,
}

impl FieldLayout {
    /// 由块序列构造
    pub fn new(sig: TensorSig, angular: bool, blocks: Vec<Arc<BlockLayout>>) -> Self {
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut index = HashMap::with_capacity(blocks.len());
        let mut size = 0;
        for (i, b) in blocks.iter().enumerate() {
            offsets.push(size);
            index.insert(b.key, i);
            size += b.size;
        }
        Self {
            sig,
            angular,
            blocks,
            offsets,
            index,
            size,
        }
    }

    /// 总系数个数
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 所有块
    #[inline]
    pub fn blocks(&self) -> &[Arc<BlockLayout>] {
        &self.blocks
    }

    /// 模式键序列
    pub fn keys(&self) -> impl Iterator<Item = ModeKey> + '_ {
        self.blocks.iter().map(|b| b.key)
    }

    /// 查找模式键对应的块及其全局偏移
    pub fn block(&self, key: ModeKey) -> Option<(&Arc<BlockLayout>, usize)> {
        self.index
            .get(&key)
            .map(|&i| (&self.blocks[i], self.offsets[i]))
    }

    /// 取出某块的系数（布局中不存在的模式返回 `None`）
    pub fn extract<'a>(&self, coeffs: &'a [Complex64], key: ModeKey) -> Option<&'a [Complex64]> {
        self.block(key)
            .map(|(b, off)| &coeffs[off..off + b.size])
    }

    /// 写入某块的系数
    pub fn insert(&self, coeffs: &mut [Complex64], key: ModeKey, block: &[Complex64]) -> CvResult<()> {
        let (b, off) = self
            .block(key)
            .ok_or_else(|| CvError::configuration(format!("布局中不存在模式 {key}")))?;
        CvError::check_size("block", b.size, block.len())?;
        coeffs[off..off + b.size].copy_from_slice(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn col(count: usize) -> Column {
        Column {
            spins: smallvec![(0, Complex64::new(1.0, 0.0))],
            lambda: 0,
            count,
            offset: 0,
        }
    }

    #[test]
    fn test_offsets() {
        let sig = TensorSig::new(3, 0);
        let b0 = Arc::new(BlockLayout::new(ModeKey::new(0, 0), sig, vec![col(4)]));
        let b1 = Arc::new(BlockLayout::new(ModeKey::new(0, 1), sig, vec![col(3), col(2)]));
        assert_eq!(b1.columns[1].offset, 3);
        let layout = FieldLayout::new(sig, true, vec![b0, b1]);
        assert_eq!(layout.size(), 9);
        let (_, off) = layout.block(ModeKey::new(0, 1)).unwrap();
        assert_eq!(off, 4);
        let mut data = vec![Complex64::new(0.0, 0.0); 9];
        layout
            .insert(&mut data, ModeKey::new(0, 1), &[Complex64::new(1.0, 0.0); 5])
            .unwrap();
        assert_eq!(layout.extract(&data, ModeKey::new(0, 0)).unwrap()[3].re, 0.0);
        assert!(layout.extract(&data, ModeKey::new(1, 1)).is_none());
    }
}
