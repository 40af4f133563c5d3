// crates/cv_spectral/src/csr.rs

//! 压缩稀疏行（CSR）矩阵格式
//!
//! 子问题的质量矩阵、刚度矩阵、NCC 乘积矩阵和各类算子矩阵都以 CSR 存储。
//! 支持实数与复数标量（`S: SparseScalar`）。
//!
//! # 特性开关
//!
//! - `parallel`: 启用基于 `rayon` 的并行矩阵-向量乘法
//!
//! # 使用示例
//!
//! ```
//! use cv_spectral::csr::{CsrBuilder, CsrMatrix};
//!
//! let mut builder = CsrBuilder::<f64>::new(2, 3);
//! builder.set(0, 0, 4.0);
//! builder.set(1, 2, -1.0);
//! let a = builder.build();
//!
//! let mut y = vec![0.0; 2];
//! a.mul_vec(&[1.0, 2.0, 3.0], &mut y);
//! assert_eq!(y, vec![4.0, -3.0]);
//! ```

use nalgebra::DMatrix;
use num_complex::Complex64;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::{AddAssign, Mul, MulAssign, Neg, Sub};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// =============================================================================
// 标量约束
// =============================================================================

/// 稀疏矩阵标量
pub trait SparseScalar:
    nalgebra::Scalar
    + Copy
    + Send
    + Sync
    + Zero
    + One
    + AddAssign
    + MulAssign
    + Mul<Output = Self>
    + Sub<Output = Self>
    + Neg<Output = Self>
{
    /// 模长
    fn modulus(self) -> f64;
    /// 由实数构造
    fn from_real(x: f64) -> Self;
}

impl SparseScalar for f64 {
    #[inline]
    fn modulus(self) -> f64 {
        self.abs()
    }
    #[inline]
    fn from_real(x: f64) -> Self {
        x
    }
}

impl SparseScalar for Complex64 {
    #[inline]
    fn modulus(self) -> f64 {
        self.norm()
    }
    #[inline]
    fn from_real(x: f64) -> Self {
        Complex64::new(x, 0.0)
    }
}

// =============================================================================
// 稀疏模式（与值分离，用于复用）
// =============================================================================

/// CSR 矩阵的稀疏模式
#[derive(Debug, Clone, PartialEq)]
pub struct CsrPattern {
    n_rows: usize,
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl CsrPattern {
    /// 获取行数
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// 获取列数
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// 获取非零元数量
    #[inline]
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// 获取第 row 行的非零元列索引
    #[inline]
    pub fn row_indices(&self, row: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    /// 查找 (row, col) 对应的值索引
    pub fn find_index(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_ptr[row];
        let end = self.row_ptr[row + 1];
        // 列索引有序，二分查找
        self.col_idx[start..end]
            .binary_search(&col)
            .ok()
            .map(|local| start + local)
    }
}

// =============================================================================
// CSR 矩阵主体
// =============================================================================

/// CSR 格式稀疏矩阵
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<S: SparseScalar> {
    pattern: CsrPattern,
    values: Vec<S>,
}

/// 复数版本的类型别名
pub type CsrMatrixC64 = CsrMatrix<Complex64>;

impl<S: SparseScalar> CsrMatrix<S> {
    /// 全零矩阵
    pub fn zeros(n_rows: usize, n_cols: usize) -> Self {
        CsrBuilder::new(n_rows, n_cols).build()
    }

    /// 单位矩阵
    pub fn identity(n: usize) -> Self {
        let mut builder = CsrBuilder::<S>::new_square(n);
        for i in 0..n {
            builder.set(i, i, S::one());
        }
        builder.build()
    }

    /// 获取行数
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.pattern.n_rows()
    }

    /// 获取列数
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.pattern.n_cols()
    }

    /// 获取非零元数量
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// 获取值切片
    #[inline]
    pub fn values(&self) -> &[S] {
        &self.values
    }

    /// 获取 (row, col) 位置的值（不存在返回 0）
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> S {
        self.pattern
            .find_index(row, col)
            .map_or(S::zero(), |idx| self.values[idx])
    }

    /// 获取第 row 行的非零元视图
    #[inline]
    pub fn row(&self, row: usize) -> RowView<'_, S> {
        let start = self.pattern.row_ptr[row];
        let end = self.pattern.row_ptr[row + 1];
        RowView {
            col_idx: &self.pattern.col_idx[start..end],
            values: &self.values[start..end],
        }
    }

    /// 矩阵-向量乘法 y = A * x
    ///
    /// # Panics
    /// - `x.len() != self.n_cols()`
    /// - `y.len() != self.n_rows()`
    pub fn mul_vec(&self, x: &[S], y: &mut [S]) {
        assert_eq!(x.len(), self.n_cols(), "x 长度必须等于矩阵列数");
        assert_eq!(y.len(), self.n_rows(), "y 长度必须等于矩阵行数");
        for (row, out) in y.iter_mut().enumerate() {
            *out = self.row(row).dot(x);
        }
    }

    /// 矩阵-向量乘法加法 y += alpha * A * x
    pub fn mul_vec_add(&self, alpha: S, x: &[S], y: &mut [S]) {
        assert_eq!(x.len(), self.n_cols(), "x 长度必须等于矩阵列数");
        assert_eq!(y.len(), self.n_rows(), "y 长度必须等于矩阵行数");
        for (row, out) in y.iter_mut().enumerate() {
            *out += alpha * self.row(row).dot(x);
        }
    }

    /// 并行矩阵-向量乘法（需启用 `parallel` 特性），按行划分
    #[cfg(feature = "parallel")]
    pub fn mul_vec_parallel(&self, x: &[S], y: &mut [S]) {
        assert_eq!(x.len(), self.n_cols(), "x 长度必须等于矩阵列数");
        assert_eq!(y.len(), self.n_rows(), "y 长度必须等于矩阵行数");
        y.par_iter_mut()
            .enumerate()
            .for_each(|(row, out)| *out = self.row(row).dot(x));
    }

    /// 矩阵乘法 `self * rhs`
    pub fn matmul(&self, rhs: &CsrMatrix<S>) -> CsrMatrix<S> {
        assert_eq!(self.n_cols(), rhs.n_rows(), "矩阵乘法维度不匹配");
        let mut builder = CsrBuilder::new(self.n_rows(), rhs.n_cols());
        for i in 0..self.n_rows() {
            for (k, a) in self.row(i).iter() {
                for (j, b) in rhs.row(k).iter() {
                    builder.add(i, j, a * b);
                }
            }
        }
        builder.build()
    }

    /// `self + alpha * other`（稀疏模式取并集）
    pub fn add_scaled(&self, alpha: S, other: &CsrMatrix<S>) -> CsrMatrix<S> {
        assert_eq!(self.n_rows(), other.n_rows(), "行数不匹配");
        assert_eq!(self.n_cols(), other.n_cols(), "列数不匹配");
        let mut builder = CsrBuilder::new(self.n_rows(), self.n_cols());
        builder.add_block(0, 0, self, S::one());
        builder.add_block(0, 0, other, alpha);
        builder.build()
    }

    /// 原地缩放
    pub fn scale(&mut self, factor: S) {
        for v in &mut self.values {
            *v *= factor;
        }
    }

    /// 最大元素模长
    pub fn max_abs(&self) -> f64 {
        self.values.iter().map(|v| v.modulus()).fold(0.0, f64::max)
    }

    /// 丢弃模长不超过 `rel · max|A|` 的元素
    pub fn pruned(&self, rel: f64) -> CsrMatrix<S> {
        let threshold = rel * self.max_abs();
        let mut builder = CsrBuilder::new(self.n_rows(), self.n_cols());
        for i in 0..self.n_rows() {
            for (j, v) in self.row(i).iter() {
                if v.modulus() > threshold {
                    builder.set(i, j, v);
                }
            }
        }
        builder.build()
    }

    /// 转为稠密矩阵
    pub fn to_dense(&self) -> DMatrix<S> {
        let mut dense = DMatrix::<S>::zeros(self.n_rows(), self.n_cols());
        for i in 0..self.n_rows() {
            for (j, v) in self.row(i).iter() {
                dense[(i, j)] = v;
            }
        }
        dense
    }

    /// 导出三元组
    pub fn to_triplets(&self) -> CsrTriplets<S> {
        let mut rows = Vec::with_capacity(self.nnz());
        let mut cols = Vec::with_capacity(self.nnz());
        for i in 0..self.n_rows() {
            for &j in self.pattern.row_indices(i) {
                rows.push(i);
                cols.push(j);
            }
        }
        CsrTriplets {
            n_rows: self.n_rows(),
            n_cols: self.n_cols(),
            rows,
            cols,
            values: self.values.clone(),
        }
    }

    /// 由三元组重建（重复位置累加）
    pub fn from_triplets(t: &CsrTriplets<S>) -> Self {
        let mut builder = CsrBuilder::new(t.n_rows, t.n_cols);
        for ((&i, &j), &v) in t.rows.iter().zip(&t.cols).zip(&t.values) {
            builder.add(i, j, v);
        }
        builder.build()
    }
}

/// 矩阵三元组，用于持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrTriplets<S> {
    /// 行数
    pub n_rows: usize,
    /// 列数
    pub n_cols: usize,
    /// 行索引
    pub rows: Vec<usize>,
    /// 列索引
    pub cols: Vec<usize>,
    /// 值
    pub values: Vec<S>,
}

// =============================================================================
// 行视图
// =============================================================================

/// 行视图（用于高效遍历）
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a, S> {
    col_idx: &'a [usize],
    values: &'a [S],
}

impl<'a, S: SparseScalar> RowView<'a, S> {
    /// 非零元数量
    #[inline]
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// (列索引, 值) 迭代器
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (usize, S)> + 'a {
        self.col_idx.iter().copied().zip(self.values.iter().copied())
    }

    /// 与稠密向量的内积
    #[inline]
    pub fn dot(&self, x: &[S]) -> S {
        let mut sum = S::zero();
        for (j, v) in self.iter() {
            sum += v * x[j];
        }
        sum
    }
}

// =============================================================================
// CSR 构建器
// =============================================================================

/// CSR 矩阵构建器（行内有序映射）
#[derive(Debug, Clone)]
pub struct CsrBuilder<S: SparseScalar> {
    n_rows: usize,
    n_cols: usize,
    rows: Vec<BTreeMap<usize, S>>,
}

impl<S: SparseScalar> CsrBuilder<S> {
    /// 创建方阵构建器
    pub fn new_square(n: usize) -> Self {
        Self::new(n, n)
    }

    /// 创建构建器（允许空行或空列，对应空模式组块）
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            rows: vec![BTreeMap::new(); n_rows],
        }
    }

    /// 行数
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// 列数
    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// 设置 (row, col) 的值（覆盖）
    ///
    /// # Panics
    /// - 索引越界
    pub fn set(&mut self, row: usize, col: usize, value: S) {
        assert!(row < self.n_rows, "行索引越界");
        assert!(col < self.n_cols, "列索引越界");
        self.rows[row].insert(col, value);
    }

    /// 累加到 (row, col)
    pub fn add(&mut self, row: usize, col: usize, value: S) {
        assert!(row < self.n_rows, "行索引越界");
        assert!(col < self.n_cols, "列索引越界");
        *self.rows[row].entry(col).or_insert_with(S::zero) += value;
    }

    /// 将 `alpha * block` 累加到以 (row0, col0) 为左上角的位置
    pub fn add_block(&mut self, row0: usize, col0: usize, block: &CsrMatrix<S>, alpha: S) {
        assert!(row0 + block.n_rows() <= self.n_rows, "块行越界");
        assert!(col0 + block.n_cols() <= self.n_cols, "块列越界");
        for i in 0..block.n_rows() {
            for (j, v) in block.row(i).iter() {
                *self.rows[row0 + i].entry(col0 + j).or_insert_with(S::zero) += alpha * v;
            }
        }
    }

    /// 获取 (row, col) 的当前值（不存在返回 0）
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> S {
        self.rows[row].get(&col).copied().unwrap_or_else(S::zero)
    }

    /// 当前非零元总数
    #[inline]
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }

    /// 构建 CSR 矩阵（消耗构建器）
    pub fn build(self) -> CsrMatrix<S> {
        let nnz = self.nnz();
        let mut row_ptr = Vec::with_capacity(self.n_rows + 1);
        let mut col_idx = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);
        row_ptr.push(0);
        for row_map in self.rows {
            for (col, val) in row_map {
                col_idx.push(col);
                values.push(val);
            }
            row_ptr.push(col_idx.len());
        }
        CsrMatrix {
            pattern: CsrPattern {
                n_rows: self.n_rows,
                n_cols: self.n_cols,
                row_ptr,
                col_idx,
            },
            values,
        }
    }
}

// =============================================================================
// 单元测试
// =============================================================================
