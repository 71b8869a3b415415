use rand::distr::Alphanumeric;
use rand::Rng;

/// Random `[A-Za-z0-9]` string from the thread local CSPRNG, used for session ids.
pub fn generate_random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[test]
fn test_random_string() {
    let s1 = generate_random_string(32);
    let s2 = generate_random_string(32);
    assert_eq!(s1.len(), 32);
    assert!(s1.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(s1, s2);
}
