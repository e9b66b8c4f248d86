mod common;

use common::*;
use opal::*;
use serial_test::serial;

#[test]
#[serial]
fn timeline_semaphores_advance_from_the_host() {
    let mut device = match headless_device("timeline_semaphores_advance_from_the_host") {
        Some(d) => d,
        None => return,
    };

    if !device.timeline_supported() {
        eprintln!("skipping timeline_semaphores_advance_from_the_host: driver lacks timeline semaphores");
        device.destroy();
        return;
    }

    let sem = device.make_timeline_semaphore().unwrap();
    assert!(device.semaphore(sem).unwrap().is_timeline());
    assert_eq!(device.semaphore(sem).unwrap().value(), 0);

    let first = device.signal_timeline(sem).unwrap();
    assert_eq!(first, 1);
    device.wait_timeline(sem, first, u64::MAX).unwrap();

    let second = device.signal_timeline(sem).unwrap();
    assert_eq!(second, 2);
    device.wait_timeline(sem, second, u64::MAX).unwrap();
    assert_eq!(device.semaphore(sem).unwrap().value(), 2);

    device.destroy_semaphore(sem);
    device.destroy();
}

#[test]
#[serial]
fn timeline_creation_fails_cleanly_without_support() {
    let mut device = match headless_device("timeline_creation_fails_cleanly_without_support") {
        Some(d) => d,
        None => return,
    };

    let res = device.make_timeline_semaphore();
    if device.timeline_supported() {
        device.destroy_semaphore(res.unwrap());
    } else {
        assert!(matches!(res, Err(GPUError::Unimplemented(_))));
    }
    device.destroy();
}

#[test]
#[serial]
fn mapped_buffer_writes_survive_an_unmap() {
    let mut device = match headless_device("mapped_buffer_writes_survive_an_unmap") {
        Some(d) => d,
        None => return,
    };

    let buf = device
        .make_buffer(&BufferInfo {
            debug_name: "scratch",
            byte_size: 64,
            usage: BufferUsage::Storage,
            visibility: MemoryVisibility::CpuAndGpu,
            ..Default::default()
        })
        .unwrap();

    let mapped = device.map_buffer_mut(buf).unwrap();
    for (i, b) in mapped.iter_mut().enumerate() {
        *b = i as u8;
    }
    device.unmap_buffer(buf).unwrap();

    let mapped = device.map_buffer_mut(buf).unwrap();
    assert!(mapped.iter().enumerate().all(|(i, b)| *b == i as u8));
    device.unmap_buffer(buf).unwrap();

    device.destroy_buffer(buf);
    device.destroy();
}

#[test]
#[serial]
fn fresh_fences_start_signaled() {
    let mut device = match headless_device("fresh_fences_start_signaled") {
        Some(d) => d,
        None => return,
    };

    let fence = device.make_fence().unwrap();
    // A signaled fence must satisfy a wait without any prior submission.
    device.wait_fence(fence, 0).unwrap();
    device.destroy_fence(fence);
    device.destroy();
}
