//! Buffer pool invariants
//!
//! For any sequence of acquires and releases against a pool of minimum
//! size M: after the deferred shrink pass runs, the pool size is exactly
//! max(M, outstanding).

use boreal_rdp_server::buffer::{BufferPool, PooledBuffer};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum PoolOp {
    Acquire,
    /// Release the nth oldest held buffer (modulo the held count)
    Release(usize),
}

fn pool_ops() -> impl Strategy<Value = Vec<PoolOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(PoolOp::Acquire),
            2 => (0usize..16).prop_map(PoolOp::Release),
        ],
        0..64,
    )
}

proptest! {
    #[test]
    fn shrink_restores_max_of_minimum_and_outstanding(
        minimum_size in 1u32..6,
        ops in pool_ops(),
    ) {
        let pool = BufferPool::new(minimum_size);
        let mut held: Vec<PooledBuffer> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Acquire => held.push(pool.acquire()),
                PoolOp::Release(n) => {
                    if !held.is_empty() {
                        let index = n % held.len();
                        held.swap_remove(index);
                    }
                }
            }

            pool.run_deferred_shrink();
            let outstanding = held.len() as u32;
            prop_assert_eq!(pool.outstanding(), outstanding);
            prop_assert_eq!(pool.pool_size(), minimum_size.max(outstanding));
        }
    }
}

#[test]
fn resized_pool_serves_resized_buffers() {
    let pool = BufferPool::new(2);
    pool.resize_buffers(800, 600, 800 * 4).unwrap();

    let a = pool.acquire();
    let b = pool.acquire();
    let c = pool.acquire(); // minted past the minimum
    for buffer in [&a, &b, &c] {
        assert_eq!(buffer.width(), 800);
        assert_eq!(buffer.height(), 600);
        assert_eq!(buffer.local_data().unwrap().len(), 800 * 4 * 600);
    }

    drop((a, b, c));
    pool.run_deferred_shrink();
    assert_eq!(pool.pool_size(), 2);
}
