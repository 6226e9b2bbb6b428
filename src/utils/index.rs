use alloy_primitives::U256;

/// Decimals of both native tokens.
pub const NATIVE_DECIMALS: u8 = 18;

/// Renders a raw integer amount as a fixed-point decimal, without trailing zeros.
pub fn format_token_amount(amount: U256, decimals: u8) -> String {
	if decimals == 0 {
		return amount.to_string();
	}
	let digits = amount.to_string();
	let decimals = decimals as usize;
	let padded = format!("{:0>width$}", digits, width = decimals + 1);
	let (whole, fraction) = padded.split_at(padded.len() - decimals);
	let fraction = fraction.trim_end_matches('0');
	if fraction.is_empty() {
		whole.to_string()
	} else {
		format!("{}.{}", whole, fraction)
	}
}
