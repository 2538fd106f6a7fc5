//! `BiBOP` (Big Bag of Pages) memory layout tests: size-class routing,
//! alignment, and non-overlap across many concurrent allocations.

use bastion_alloc::test_util::small_engine;

#[test]
fn different_size_classes_round_trip() {
    let engine = small_engine();
    let small = engine.allocate(1).expect("alloc small");
    let medium = engine.allocate(32).expect("alloc medium");
    let large = engine.allocate(64).expect("alloc large");
    let very_large = engine.allocate(112).expect("alloc very large");

    unsafe {
        *small = 1;
        (medium.cast::<u64>()).write_unaligned(2);
        (large.cast::<u64>()).write_unaligned(3);
        (very_large.cast::<u64>()).write_unaligned(4);
    }

    assert_eq!(unsafe { *small }, 1);
    assert_eq!(unsafe { (medium.cast::<u64>()).read_unaligned() }, 2);
    assert_eq!(unsafe { (large.cast::<u64>()).read_unaligned() }, 3);
    assert_eq!(unsafe { (very_large.cast::<u64>()).read_unaligned() }, 4);

    engine.free(small);
    engine.free(medium);
    engine.free(large);
    engine.free(very_large);
}

#[test]
fn many_small_allocations_stay_independently_addressable() {
    let engine = small_engine();
    let ptrs: Vec<*mut u8> = (0..300)
        .map(|i| {
            let p = engine.allocate(1).expect("alloc");
            unsafe { *p = (i % 256) as u8 };
            p
        })
        .collect();

    for (i, &p) in ptrs.iter().enumerate() {
        assert_eq!(unsafe { *p }, (i % 256) as u8);
    }
    for p in ptrs {
        engine.free(p);
    }
}

#[test]
fn mixed_size_allocations_do_not_corrupt_each_other() {
    let engine = small_engine();
    let mut smalls = Vec::new();
    let mut mediums = Vec::new();
    let mut larges = Vec::new();

    for i in 0..64u64 {
        let s = engine.allocate(1).unwrap();
        unsafe { *s = i as u8 };
        smalls.push(s);

        let m = engine.allocate(32).unwrap();
        unsafe { (m.cast::<u64>()).write_unaligned(i) };
        mediums.push(m);

        let l = engine.allocate(64).unwrap();
        unsafe { (l.cast::<u64>()).write_unaligned(i * 2) };
        larges.push(l);
    }

    for i in 0..64u64 {
        assert_eq!(unsafe { *smalls[i as usize] }, i as u8);
        assert_eq!(unsafe { (mediums[i as usize].cast::<u64>()).read_unaligned() }, i);
        assert_eq!(unsafe { (larges[i as usize].cast::<u64>()).read_unaligned() }, i * 2);
    }

    for p in smalls.into_iter().chain(mediums).chain(larges) {
        engine.free(p);
    }
}

#[test]
fn large_object_engine_handles_multi_kilobyte_requests() {
    let engine = small_engine();
    let threshold = engine.config().large_threshold;
    let huge = engine.allocate(threshold + 4096).expect("alloc huge");
    unsafe {
        std::ptr::write_bytes(huge, 0x42, threshold + 4096);
    }
    assert_eq!(unsafe { *huge }, 0x42);
    assert_eq!(unsafe { *huge.add(threshold + 4095) }, 0x42);
    assert_eq!(engine.usable_size(huge), Some(threshold + 4096));
    engine.free(huge);
}

#[test]
fn multiple_large_objects_are_independently_addressable() {
    let engine = small_engine();
    let threshold = engine.config().large_threshold;
    let ptrs: Vec<*mut u8> = (0..6)
        .map(|i| {
            let p = engine.allocate(threshold + 1024).unwrap();
            unsafe { std::ptr::write_bytes(p, i as u8, 1024) };
            p
        })
        .collect();

    for (i, &p) in ptrs.iter().enumerate() {
        assert_eq!(unsafe { *p }, i as u8);
    }
    for p in ptrs {
        engine.free(p);
    }
}

#[test]
fn repeated_allocation_rounds_stay_consistent() {
    let engine = small_engine();
    for _ in 0..10 {
        let ptrs: Vec<*mut u8> = (0..100)
            .map(|i| {
                let p = engine.allocate(32).unwrap();
                unsafe { (p.cast::<u32>()).write_unaligned(i) };
                p
            })
            .collect();
        for (i, &p) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { (p.cast::<u32>()).read_unaligned() }, i as u32);
        }
        for p in ptrs {
            engine.free(p);
        }
    }
}

#[test]
fn every_live_pointer_is_unique() {
    let engine = small_engine();
    let ptrs: Vec<*mut u8> = (0..3).map(|_| engine.allocate(4).unwrap()).collect();
    assert_ne!(ptrs[0], ptrs[1]);
    assert_ne!(ptrs[1], ptrs[2]);
    assert_ne!(ptrs[0], ptrs[2]);
    for p in ptrs {
        engine.free(p);
    }
}
