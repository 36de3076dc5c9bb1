//! Inspect GIF structure and animation timing
use std::env;
use zengif_parse::{DecodeConfig, Unstoppable, read_gif};

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <gif-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let bytes = std::fs::read(path).expect("Failed to read file");

    match read_gif(&bytes, &DecodeConfig::default(), &Unstoppable) {
        Ok(gif) => {
            println!("File: {}", path);
            println!("Canvas: {}x{}", gif.width, gif.height);

            if gif.frames.len() > 1 {
                println!("\n=== Animation ===");
                match gif.loop_count {
                    0 => println!("Loop count: forever"),
                    n => println!("Loop count: {}", n),
                }
                println!("Number of frames: {}", gif.frames.len());

                println!("\nFirst 5 frames:");
                for frame in gif.frames.iter().take(5) {
                    let opaque = frame.pixels.iter().filter(|p| p.a == 255).count();
                    println!("  Frame {}: {} opaque pixels, delay {} ms", frame.index, opaque, frame.delay_ms);
                }

                if gif.frames.len() > 5 {
                    println!("  ... ({} more frames)", gif.frames.len() - 5);
                }

                let total_ms: u32 = gif.frames.iter().map(|f| f.delay_ms).sum();
                println!("\nTotal duration: {} ms ({:.2} seconds)", total_ms, total_ms as f64 / 1000.0);
            } else {
                println!("\nNo animation (static image)");
            }
        },
        Err(e) => {
            eprintln!("Decode error: {}", e);
            std::process::exit(1);
        },
    }
}
