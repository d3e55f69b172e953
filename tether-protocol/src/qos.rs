/// Quality of service for message delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
	/// Fire and forget.
	#[default]
	AtMostOnce = 0,
	/// Acknowledged delivery, duplicates possible.
	AtLeastOnce,
	/// Assured delivery, exactly once.
	ExactlyOnce,
}

#[derive(Debug, thiserror::Error)]
#[error("quality of service must be 0, 1 or 2")]
pub struct InvalidQoS;

impl TryFrom<u8> for QoS {
	type Error = InvalidQoS;
	#[inline]
	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::AtMostOnce),
			1 => Ok(Self::AtLeastOnce),
			2 => Ok(Self::ExactlyOnce),
			_ => Err(InvalidQoS),
		}
	}
}
