#![no_main]

use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

use oasfuzz::request::substitute_path;

fuzz_target!(|input: (&str, Vec<(String, String)>)| {
    let (template, pairs) = input;
    let values: BTreeMap<String, String> = pairs.into_iter().collect();
    let path = substitute_path(template, &values);

    // Substituted values are percent-encoded, so none can introduce a new
    // path segment.
    let template_slashes = template.matches('/').count();
    assert!(path.matches('/').count() <= template_slashes);
});
