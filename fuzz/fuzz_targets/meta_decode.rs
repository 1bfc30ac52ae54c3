#![no_main]

use libfuzzer_sys::fuzz_target;
use sombra_kv::primitives::pager::{decode_meta, encode_meta};

fuzz_target!(|data: &[u8]| {
    for slot in 0..2 {
        let Ok(meta) = decode_meta(data, slot) else {
            continue;
        };
        // Anything that decodes must survive a rewrite unchanged.
        let mut page = vec![0u8; meta.page_size as usize];
        encode_meta(&meta, slot, &mut page);
        let again = decode_meta(&page, slot).expect("re-encoded meta decodes");
        assert_eq!(again, meta);
    }
});
