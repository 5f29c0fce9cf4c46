#![no_main]

use libfuzzer_sys::fuzz_target;

use oasfuzz::contract::{Contract, Router};

fuzz_target!(|data: &str| {
    // Arbitrary JSON/YAML must be rejected with an error, never a panic.
    for yaml_hint in [false, true] {
        let Ok(contract) = Contract::parse(data, yaml_hint) else {
            continue;
        };
        let _ = contract.base_path();
        for (_, _, operation) in contract.operations() {
            let _ = contract.effective_security(operation);
            for parameter in &operation.parameters {
                let _ = parameter.effective_schema();
            }
        }
        let _ = Router::new(&contract);
    }
});
