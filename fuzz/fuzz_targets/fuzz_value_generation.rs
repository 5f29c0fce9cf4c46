#![no_main]

use libfuzzer_sys::fuzz_target;

use oasfuzz::contract::SchemaNode;
use oasfuzz::generate::ValueGenerator;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let (seed, schema) = data.split_at(8);
    let Ok(node) = serde_json::from_slice::<SchemaNode>(schema) else {
        return;
    };

    let mut generator = ValueGenerator::new(Some(u64::from_le_bytes(
        seed.try_into().unwrap_or_default(),
    )));
    let value = generator.generate(&node);
    let _ = value.render();
    let _ = value.to_json();
    let _ = value.to_xml();
});
