// src/main.rs
//
// Host-less smoke test for the kernel: wires the three roles together
// in-process and drives a few quanta without a real audio callback.

mod attribute_patch;
mod buffer;
mod command_ring;
mod commit;
mod error;
mod groove;
mod header;
mod humanize;
mod kernel;
mod layout;
mod node_heap;
mod playhead;
mod synapse_table;
mod vm;

use kernel::{create_kernel, KernelConfig};

fn main() {
    let config = KernelConfig {
        node_capacity: 256,
        ring_capacity: 64,
        ppq: 960,
        bpm: 120,
        safe_zone_ticks: 0,
    };

    let (composer, worker, mut audio) = create_kernel(config);

    println!("Starting kernel smoke test...");
    println!("Composer -> Command Ring -> Worker -> Node Heap -> Audio -> Trigger Callback");
    println!();

    composer.insert(1, 60, 100, 240, 0, false, 1, None).unwrap();
    composer.insert(1, 64, 100, 240, 240, false, 2, None).unwrap();
    composer.insert(1, 67, 100, 240, 480, false, 3, None).unwrap();
    composer.set_transpose(0);
    composer.set_humanize(20, 10);
    composer.set_prng_seed(42);

    let processed = worker.process_commands(16);
    println!("Worker drained {processed} command(s).");

    let a = worker.find_by_source_id(1).unwrap();
    let b = worker.find_by_source_id(2).unwrap();
    if let (Some(a), Some(b)) = (a, b) {
        composer.connect(a, b, 1000, 0).unwrap();
        worker.process_commands(16);
        println!("Connected source {a} -> target {b}.");
    }

    for quantum in 0..4 {
        println!("--- Quantum {quantum} ---");
        audio.advance(240, |event| {
            println!(
                "  tick={} pitch={} velocity={} source_id={}",
                event.tick, event.pitch, event.velocity, event.source_id
            );
        });
        println!("  playhead_tick = {}", audio.playhead_tick());
    }

    println!();
    println!("Kernel smoke test completed.");
}
