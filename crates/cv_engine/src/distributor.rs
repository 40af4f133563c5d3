// crates/cv_engine/src/distributor.rs

//! 进程间通信与网格分布
//!
//! 网格沿 φ 方向按进程连续切分。跨进程的数据交换只经过
//! [`Communicator`]：
//!
//! - [`SelfComm`]：单进程，归约即恒等
//! - [`ThreadComm`]：同一进程内 N 个线程扮演 N 个进程，归约带屏障语义
//!
//! [`GlobalArrayReducer`] 在此之上提供全局和、最大值、均值与体积分。

use crate::field::Field;
use cv_foundation::{CvError, CvResult};
use ndarray::{Array4, Axis, Slice};
use num_complex::Complex64;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::{Arc, Barrier};

/// 归约运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// 求和
    Sum,
    /// 最大值
    Max,
    /// 最小值
    Min,
}

impl ReduceOp {
    fn identity(&self) -> f64 {
        match self {
            Self::Sum => 0.0,
            Self::Max => f64::NEG_INFINITY,
            Self::Min => f64::INFINITY,
        }
    }

    fn combine(&self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            Self::Max => a.max(b),
            Self::Min => a.min(b),
        }
    }
}

/// 进程组通信
pub trait Communicator: Send + Sync + Debug {
    /// 本进程编号
    fn rank(&self) -> usize;

    /// 进程数
    fn size(&self) -> usize;

    /// 逐元素全归约（所有进程须以相同长度调用）
    fn reduce(&self, values: &[f64], op: ReduceOp) -> Vec<f64>;

    /// 标量求和
    fn reduce_sum(&self, value: f64) -> f64 {
        self.reduce(&[value], ReduceOp::Sum)[0]
    }

    /// 标量最大值
    fn reduce_max(&self, value: f64) -> f64 {
        self.reduce(&[value], ReduceOp::Max)[0]
    }
}

/// 单进程通信
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn reduce(&self, values: &[f64], _op: ReduceOp) -> Vec<f64> {
        values.to_vec()
    }
}

#[derive(Debug)]
struct ThreadShared {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// 线程模拟的进程组
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<ThreadShared>,
}

impl ThreadComm {
    /// 创建 `n` 个成员，各自交给一个线程
    pub fn group(n: usize) -> Vec<ThreadComm> {
        let n = n.max(1);
        let shared = Arc::new(ThreadShared {
            size: n,
            barrier: Barrier::new(n),
            slots: Mutex::new(vec![Vec::new(); n]),
        });
        (0..n)
            .map(|rank| ThreadComm {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn reduce(&self, values: &[f64], op: ReduceOp) -> Vec<f64> {
        self.shared.slots.lock()[self.rank] = values.to_vec();
        self.shared.barrier.wait();
        let out = {
            let slots = self.shared.slots.lock();
            let mut acc = vec![op.identity(); values.len()];
            for slot in slots.iter() {
                for (a, v) in acc.iter_mut().zip(slot) {
                    *a = op.combine(*a, *v);
                }
            }
            acc
        };
        // 所有成员读完后才允许下一轮写入
        self.shared.barrier.wait();
        out
    }
}

// =============================================================================
// 分布
// =============================================================================

/// 沿 φ 方向的网格分布
#[derive(Debug, Clone)]
pub struct Distributor {
    comm: Arc<dyn Communicator>,
}

impl Distributor {
    /// 以通信器创建
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    /// 单进程分布
    pub fn serial() -> Self {
        Self::new(Arc::new(SelfComm))
    }

    /// 通信器
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// 本进程编号
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// 进程数
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// 长度 `len` 的轴上本进程负责的区间（余数分给编号小的进程）
    pub fn local_range(&self, len: usize) -> Range<usize> {
        let (size, rank) = (self.size(), self.rank());
        let base = len / size;
        let rem = len % size;
        let start = rank * base + rank.min(rem);
        let count = base + usize::from(rank < rem);
        start..start + count
    }

    /// 取出数组在轴 `axis` 上的本地部分
    pub fn distribute(&self, array: &Array4<Complex64>, axis: usize) -> CvResult<Array4<Complex64>> {
        if axis >= 4 {
            return Err(CvError::configuration(format!("轴 {axis} 超出范围")));
        }
        let range = self.local_range(array.len_of(Axis(axis)));
        Ok(array
            .slice_axis(Axis(axis), Slice::from(range))
            .to_owned())
    }
}

// =============================================================================
// 全局归约
// =============================================================================

/// 分布式数组的全局统计
#[derive(Debug, Clone)]
pub struct GlobalArrayReducer {
    dist: Distributor,
}

impl GlobalArrayReducer {
    /// 创建
    pub fn new(dist: Distributor) -> Self {
        Self { dist }
    }

    /// 分布
    pub fn distributor(&self) -> &Distributor {
        &self.dist
    }

    /// 全局和
    pub fn global_sum(&self, local: &[f64]) -> f64 {
        self.dist.comm.reduce_sum(local.iter().sum())
    }

    /// 全局最大值（全空时为 -∞）
    pub fn global_max(&self, local: &[f64]) -> f64 {
        let m = local.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.dist.comm.reduce_max(m)
    }

    /// 全局均值（全空时为 NaN）
    pub fn global_mean(&self, local: &[f64]) -> f64 {
        let s = self
            .dist
            .comm
            .reduce(&[local.iter().sum(), local.len() as f64], ReduceOp::Sum);
        s[0] / s[1]
    }

    /// 标量场的体积分（各进程只积分本地 φ 区间）
    pub fn volume_integral(&self, field: &Field) -> CvResult<Complex64> {
        let nphi = field.grid_shape()?[0];
        let local = field.integrate_range(self.dist.local_range(nphi))?;
        let s = self.dist.comm.reduce(&[local.re, local.im], ReduceOp::Sum);
        Ok(Complex64::new(s[0], s[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_local_ranges_cover_axis() {
        for size in 1..=5 {
            let comms = ThreadComm::group(size);
            let mut next = 0;
            for c in comms {
                let r = Distributor::new(Arc::new(c)).local_range(13);
                assert_eq!(r.start, next);
                next = r.end;
            }
            assert_eq!(next, 13);
        }
    }

    #[test]
    fn test_thread_reduce() {
        let comms = ThreadComm::group(4);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let r = c.rank() as f64;
                    let sum = c.reduce_sum(r + 1.0);
                    let max = c.reduce_max(-r);
                    let v = c.reduce(&[r, 2.0 * r], ReduceOp::Min);
                    (sum, max, v)
                })
            })
            .collect();
        for h in handles {
            let (sum, max, v) = h.join().unwrap();
            assert_eq!(sum, 10.0);
            assert_eq!(max, 0.0);
            assert_eq!(v, vec![0.0, 0.0]);
        }
    }

    #[test]
    fn test_reducer_statistics() {
        let reducer = GlobalArrayReducer::new(Distributor::serial());
        let data = [1.0, -2.0, 4.0];
        assert_eq!(reducer.global_sum(&data), 3.0);
        assert_eq!(reducer.global_max(&data), 4.0);
        assert_eq!(reducer.global_mean(&data), 1.0);
    }

    #[test]
    fn test_distribute_slices_phi() {
        let comms = ThreadComm::group(3);
        let a = Array4::<Complex64>::zeros((2, 8, 3, 1));
        let dist = Distributor::new(Arc::new(comms[2].clone()));
        let local = dist.distribute(&a, 1).unwrap();
        assert_eq!(local.dim(), (2, 2, 3, 1));
        assert!(dist.distribute(&a, 4).is_err());
    }
}
