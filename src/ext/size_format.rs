const PREFIXES: [(u32, &str); 4] = [(40, "T"), (30, "G"), (20, "M"), (10, "K")];

/// Human readable size with binary prefixes, e.g. `1.50 MB`.
///
/// With `align` the number is padded to eight characters and unit-less sizes keep a blank prefix,
/// so that sizes printed in a column line up.
pub fn format_size(bytes: u64, align: bool) -> String {
    let (exponent, prefix) = PREFIXES
        .iter()
        .copied()
        .find(|(exponent, _)| bytes >= 1u64 << exponent)
        .unwrap_or((0, if align { " " } else { "" }));
    let scaled = bytes as f64 / (1u64 << exponent) as f64;
    let width = if align { 8 } else { 0 };
    format!("{scaled:width$.2} {prefix}B")
}
