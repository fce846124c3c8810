//! Deterministic operation sequences checked against both backends.

use memguard_core::{AllocatorConfig, BackendKind, MemAllocator, ReportSink};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

const BACKENDS: [BackendKind; 2] = [BackendKind::Light, BackendKind::Secured];

fn quiet(kind: BackendKind) -> MemAllocator {
    MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(kind)
            .with_report_sink(ReportSink::Silent),
    )
}

fn fill(ptr: *mut u8, len: usize, rng: &mut XorShift64) {
    for i in 0..len {
        unsafe { ptr.add(i).write(rng.next_u64() as u8) };
    }
}

fn bytes<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(ptr, len) }
}

#[test]
fn malloc_free_counters_move_by_exact_deltas() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 2_000;
    const SLOTS: usize = 32;

    for kind in BACKENDS {
        for seed in SEEDS {
            let alloc = quiet(kind);
            let mut rng = XorShift64::new(seed);
            let mut ptrs = [std::ptr::null_mut::<u8>(); SLOTS];
            let mut sizes = [0_usize; SLOTS];

            for step in 0..STEPS {
                let slot = rng.gen_range_usize(0, SLOTS - 1);
                let blocks = alloc.get_totblock();
                let in_use = alloc.get_mem_in_use();

                if ptrs[slot].is_null() {
                    let len = rng.gen_range_usize(0, 300);
                    let p = match rng.gen_range_usize(0, 2) {
                        0 => alloc.malloc(len, "seq"),
                        1 => alloc.calloc(len, "seq"),
                        _ => alloc.malloc_aligned(len, 1 << rng.gen_range_usize(3, 9), "seq"),
                    };
                    assert!(!p.is_null(), "{kind} seed={seed} step={step}: null for len={len}");
                    assert_eq!(alloc.get_totblock(), blocks + 1);
                    assert_eq!(alloc.get_mem_in_use(), in_use + len);
                    ptrs[slot] = p;
                    sizes[slot] = len;
                } else {
                    unsafe { alloc.free(ptrs[slot]) };
                    assert_eq!(alloc.get_totblock(), blocks - 1);
                    assert_eq!(alloc.get_mem_in_use(), in_use - sizes[slot]);
                    ptrs[slot] = std::ptr::null_mut();
                }
            }

            assert!(alloc.check_memory(), "{kind} seed={seed}");
            for p in ptrs.into_iter().filter(|p| !p.is_null()) {
                unsafe { alloc.free(p) };
            }
            assert_eq!(alloc.get_totblock(), 0, "{kind} seed={seed}");
            assert_eq!(alloc.get_mem_in_use(), 0, "{kind} seed={seed}");
            assert!(alloc.diagnostics().is_empty(), "{kind} seed={seed}");
        }
    }
}

#[test]
fn dupalloc_is_byte_identical() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let mut rng = XorShift64::new(7);
        for len in [1_usize, 3, 8, 17, 64, 255, 4096] {
            let p = alloc.malloc(len, "orig");
            fill(p, len, &mut rng);
            let d = unsafe { alloc.dupalloc(p, "dup") };
            assert!(!d.is_null());
            assert_ne!(p, d);
            assert_eq!(bytes(p, len), bytes(d, len), "{kind} len={len}");
            if kind == BackendKind::Secured {
                assert_eq!(alloc.block_len(d), Some(len));
                assert_eq!(alloc.block_name(d), Some("dup"));
            }
            unsafe {
                alloc.free(p);
                alloc.free(d);
            }
        }
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn dupalloc_keeps_alignment() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let p = alloc.malloc_aligned(40, 128, "aligned");
        let d = unsafe { alloc.dupalloc(p, "copy") };
        assert_eq!(d as usize % 128, 0, "{kind}");
        unsafe {
            alloc.free(p);
            alloc.free(d);
        }
    }
}

#[test]
fn realloc_preserves_prefix_in_both_directions() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let mut rng = XorShift64::new(11);
        for (old, new) in [(16_usize, 64_usize), (64, 16), (1, 1000), (100, 100), (33, 0)] {
            let p = alloc.malloc(old, "grow");
            fill(p, old, &mut rng);
            let snapshot = bytes(p, old).to_vec();

            let q = unsafe { alloc.realloc(p, new) };
            assert!(!q.is_null(), "{kind} {old}->{new}");
            let kept = old.min(new);
            assert_eq!(bytes(q, kept), &snapshot[..kept], "{kind} {old}->{new}");
            assert_eq!(alloc.get_totblock(), 1);
            assert_eq!(alloc.get_mem_in_use(), new);
            if kind == BackendKind::Secured {
                assert_eq!(alloc.block_name(q), Some("grow"));
            }
            unsafe { alloc.free(q) };
        }
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn realloc_keeps_alignment_of_aligned_blocks() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let mut rng = XorShift64::new(13);
        for alignment in [8_usize, 64, 256, 512] {
            for (old, new) in [(8_usize, 3000_usize), (300, 40), (64, 64)] {
                let p = alloc.malloc_aligned(old, alignment, "aligned");
                fill(p, old, &mut rng);
                let snapshot = bytes(p, old).to_vec();
                let kept = old.min(new);

                let q = unsafe { alloc.realloc(p, new) };
                assert_eq!(q as usize % alignment, 0, "{kind} a={alignment} {old}->{new}");
                assert_eq!(bytes(q, kept), &snapshot[..kept], "{kind} a={alignment}");

                let r = unsafe { alloc.realloc_id(q, old, "renamed") };
                assert_eq!(r as usize % alignment, 0, "{kind} a={alignment} {new}->{old}");
                assert_eq!(bytes(r, kept), &snapshot[..kept], "{kind} a={alignment}");
                unsafe { alloc.free(r) };
            }
        }
        assert_eq!(alloc.get_totblock(), 0);
        assert_eq!(alloc.get_mem_in_use(), 0);
    }
}

#[test]
fn realloc_null_behaves_like_malloc() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let p = unsafe { alloc.realloc(std::ptr::null_mut(), 24) };
        assert!(!p.is_null());
        assert_eq!(alloc.get_totblock(), 1);
        assert_eq!(alloc.get_mem_in_use(), 24);
        if kind == BackendKind::Secured {
            assert_eq!(alloc.block_name(p), Some("realloc"));
        }
        let q = unsafe { alloc.realloc_id(std::ptr::null_mut(), 8, "fresh") };
        if kind == BackendKind::Secured {
            assert_eq!(alloc.block_name(q), Some("fresh"));
        }
        unsafe {
            alloc.free(p);
            alloc.free(q);
        }
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn realloc_id_renames_block() {
    let alloc = quiet(BackendKind::Secured);
    let p = alloc.malloc(8, "before");
    let q = unsafe { alloc.realloc_id(p, 16, "after") };
    assert_eq!(alloc.block_name(q), Some("after"));
    unsafe { alloc.free(q) };
}

#[test]
fn aligned_allocations_are_congruent() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let mut live = Vec::new();
        for shift in 3..10 {
            let alignment = 1_usize << shift;
            for len in [0_usize, 1, 7, 8, 100, 1023, 5000] {
                let p = alloc.malloc_aligned(len, alignment, "aligned");
                assert!(!p.is_null());
                assert_eq!(p as usize % alignment, 0, "{kind} a={alignment} len={len}");
                live.push(p);
            }
        }
        assert!(alloc.check_memory());
        for p in live {
            unsafe { alloc.free(p) };
        }
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn small_alignment_is_raised_and_bad_alignment_rejected() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let p = alloc.malloc_aligned(10, 2, "small");
        assert_eq!(p as usize % 8, 0);
        unsafe { alloc.free(p) };

        assert!(alloc.malloc_aligned(10, 1024, "huge").is_null());
        assert!(alloc.malloc_aligned(10, 24, "odd").is_null());
        let events: Vec<_> = alloc.diagnostics().iter().map(|r| r.event).collect();
        assert_eq!(events, ["invalid_alignment", "invalid_alignment"], "{kind}");
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn calloc_array_zeroes_and_overflow_is_reported() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let p = alloc.calloc_array(12, 8, "zeros");
        assert!(bytes(p, 96).iter().all(|&b| b == 0));
        assert_eq!(alloc.get_mem_in_use(), 96);
        let q = alloc.malloc_array(3, 5, "array");
        assert_eq!(alloc.get_mem_in_use(), 111);
        unsafe {
            alloc.free(p);
            alloc.free(q);
        }

        assert!(alloc.malloc_array(usize::MAX, 2, "overflow").is_null());
        assert!(alloc.calloc_array(2, usize::MAX, "overflow").is_null());
        let records = alloc.diagnostics();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.event == "allocation_failure"));
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn exhausted_system_allocator_returns_null() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        let p = alloc.malloc(usize::MAX / 2, "enormous");
        assert!(p.is_null(), "{kind}");
        let records = alloc.diagnostics();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "allocation_failure");
        assert_eq!(records[0].block, Some("enormous"));
        assert_eq!(records[0].size, Some(usize::MAX / 2));
        assert_eq!(alloc.get_totblock(), 0);
    }
}

#[test]
fn free_null_is_reported_not_fatal() {
    for kind in BACKENDS {
        let alloc = quiet(kind);
        unsafe { alloc.free(std::ptr::null_mut()) };
        let records = alloc.diagnostics();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "null_pointer");
        assert!(records[0].message.contains("attempt to free NULL pointer"));
    }
}
