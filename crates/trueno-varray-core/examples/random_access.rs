//! Random reads over a virtual array spread across four host "devices".
//!
//! Run with `RUST_LOG=trueno_varray_core=debug` to see page traffic.

use std::sync::Arc;
use std::time::Instant;
use trueno_varray_core::{ArrayConfig, DeviceMemory, HostDevice, VirtualArray};
use tracing_subscriber::EnvFilter;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Record {
    id: u64,
    payload: [u8; 64],
}

fn main() -> trueno_varray_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let len = 28_800;
    let devices: Vec<Arc<dyn DeviceMemory>> = (0..4)
        .map(|i| Arc::new(HostDevice::new(format!("gpu{i}"))) as Arc<dyn DeviceMemory>)
        .collect();
    let config = ArrayConfig::new(len, vec![12, 12, 12, 12])
        .with_page_size(1)
        .with_pages_per_channel(50);
    let cache_elements = config.cache_elements();
    let array = VirtualArray::<Record>::new(config, devices)?;

    let start = Instant::now();
    array.par_init(|i| {
        let mut payload = [0u8; 64];
        payload[i % 64] = b'A';
        Record {
            id: i as u64,
            payload,
        }
    })?;
    println!("initialised {len} records in {:?}", start.elapsed());

    let mut state = 12345u64;
    let mut window = len;
    while window >= cache_elements / 100 {
        array.reset_stats();
        let start = Instant::now();
        let mut mismatches = 0usize;
        for _ in 0..100_000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let i = ((state >> 33) as usize) % window;
            let record = array.get(i)?;
            if record.id != i as u64 || record.payload[i % 64] != b'A' {
                mismatches += 1;
            }
        }
        println!(
            "window {window:>6}: {:>10.2?}  {}  mismatches={mismatches}",
            start.elapsed(),
            array.stats()
        );
        window /= 2;
    }

    array.close()
}
