#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Fuzz YAML program parsing: it must reject garbage gracefully and never
    // panic. Valid programs must also round-trip through the serializer.
    if let Ok(program) = enose_core::parser::parse_program(data) {
        if let Ok(yaml) = enose_core::parser::program_to_yaml(&program) {
            let _ = enose_core::parser::parse_program(&yaml);
        }
    }
});
