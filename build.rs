fn main() {
    // The ESP-IDF environment is only needed when cross-compiling for the
    // Xtensa target; host builds and tests skip it entirely.
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("xtensa") {
            embuild::espidf::sysenv::output();
        }
    }
}
