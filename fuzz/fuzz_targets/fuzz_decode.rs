#![no_main]
use libfuzzer_sys::fuzz_target;

// Decode every frame of the first two passes; any panic is a bug.
fuzz_target!(|data: &[u8]| {
    let mut decoder = zengif_parse::GifDecoder::from_bytes(data);
    while let Ok(Some(frame)) = decoder.decode_next() {
        assert_eq!(frame.pixels.len(), frame.width as usize * frame.height as usize);
        if frame.pass > 1 {
            break;
        }
    }
});
