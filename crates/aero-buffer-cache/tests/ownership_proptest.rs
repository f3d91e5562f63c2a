#![cfg(not(target_arch = "wasm32"))]

mod common;

use aero_buffer_cache::{ObtainBufferOperation, ObtainBufferSynchronize};
use common::{cache_with, small_pages};
use proptest::prelude::*;

const PAGE: u64 = 0x1000;

#[derive(Debug, Clone)]
enum Op {
    Find { addr: u64, size: u64 },
    Write { addr: u64, size: u64 },
    Tick,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0x10u64..0x400, 1u64..0x6000).prop_map(|(half_page, size)| Op::Find {
            addr: half_page * 0x800,
            size,
        }),
        2 => (0x10u64..0x400, 1u64..0x3000).prop_map(|(half_page, size)| Op::Write {
            addr: half_page * 0x800,
            size,
        }),
        1 => Just(Op::Tick),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_page_has_at_most_one_owner(ops in proptest::collection::vec(op_strategy(), 1..48)) {
        let mut cache = cache_with(small_pages(), Default::default());
        for op in ops {
            match op {
                Op::Find { addr, size } => {
                    let id = cache.find_buffer(addr, size);
                    let buffer = cache.buffer(id).expect("returned buffer is live");
                    prop_assert!(buffer.is_in_bounds(addr, size));
                    prop_assert_eq!(buffer.cpu_addr() % PAGE, 0);
                    prop_assert_eq!(buffer.size_bytes() % PAGE, 0);
                }
                Op::Write { addr, size } => {
                    let obtained = cache.obtain_cpu_buffer(
                        addr,
                        size,
                        ObtainBufferSynchronize::FullSynchronize,
                        ObtainBufferOperation::MarkAsWritten,
                    );
                    prop_assert!(cache.is_buffer_valid(obtained.id));
                    prop_assert!(cache.is_region_gpu_modified(addr, size));
                }
                Op::Tick => cache.tick_frame(),
            }

            let mut spans: Vec<(u64, u64)> = cache
                .buffers()
                .map(|(_, buffer)| (buffer.cpu_addr(), buffer.end_addr()))
                .collect();
            spans.sort_unstable();
            for pair in spans.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "live buffers overlap: {:?}", pair);
            }
            for (id, buffer) in cache.buffers() {
                let mut page = buffer.cpu_addr();
                while page < buffer.end_addr() {
                    prop_assert_eq!(cache.buffer_at(page), Some(id));
                    page += PAGE;
                }
            }
        }
    }
}
