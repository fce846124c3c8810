#![no_main]
use libfuzzer_sys::fuzz_target;
use memguard_core::{AllocatorConfig, BackendKind, MemAllocator, ReportSink};

fuzz_target!(|data: &[u8]| {
    // First byte picks the backend, then 4-byte op records.
    let Some((&mode, ops)) = data.split_first() else {
        return;
    };
    let backend = if mode & 1 == 0 {
        BackendKind::Light
    } else {
        BackendKind::Secured
    };
    let alloc = MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(backend)
            .with_report_sink(ReportSink::Silent)
            .with_history_capacity(16),
    );
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for chunk in ops.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let pick = chunk[3] as usize;

        match chunk[0] % 6 {
            0 => {
                let p = alloc.malloc(size, "fuzz");
                if !p.is_null() {
                    unsafe { p.write_bytes(chunk[3], size) };
                    live.push((p, size));
                }
            }
            1 => {
                let p = alloc.calloc(size, "fuzz");
                if !p.is_null() {
                    live.push((p, size));
                }
            }
            2 => {
                let alignment = 8 << (chunk[3] % 7);
                let p = alloc.malloc_aligned(size, alignment, "fuzz-aligned");
                if !p.is_null() {
                    assert_eq!(p as usize % alignment, 0);
                    live.push((p, size));
                }
            }
            3 if !live.is_empty() => {
                let idx = pick % live.len();
                let q = unsafe { alloc.realloc(live[idx].0, size) };
                // On failure the old block stays valid.
                if !q.is_null() {
                    live[idx] = (q, size);
                }
            }
            4 if !live.is_empty() => {
                let idx = pick % live.len();
                let (p, len) = live[idx];
                let d = unsafe { alloc.dupalloc(p, "fuzz-dup") };
                if !d.is_null() {
                    let same = unsafe {
                        std::slice::from_raw_parts(p, len) == std::slice::from_raw_parts(d, len)
                    };
                    assert!(same);
                    live.push((d, len));
                }
            }
            5 if !live.is_empty() => {
                let (p, _) = live.swap_remove(pick % live.len());
                unsafe { alloc.free(p) };
            }
            _ => {}
        }
    }

    let expected: usize = live.iter().map(|&(_, len)| len).sum();
    assert_eq!(alloc.get_totblock(), live.len());
    assert_eq!(alloc.get_mem_in_use(), expected);
    assert!(alloc.check_memory());

    for (p, _) in live {
        unsafe { alloc.free(p) };
    }
    assert_eq!(alloc.get_totblock(), 0);
});
