#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let config = zengif_parse::DecodeConfig::default()
        .with_peak_memory_limit(16 * 1024 * 1024)
        .with_max_canvas_pixels(1024 * 1024)
        .with_max_frames_per_pass(64);
    let _ = zengif_parse::read_gif(data, &config, &enough::Unstoppable);
});
