use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

pub use tokio_modbus::{Address, Quantity};

/// 16-bit value stored in Modbus register.
pub type Word = u16;

/// State string meaning "no last known value".
pub const STATE_UNAVAILABLE: &str = "unavailable";

#[derive(Debug)]
pub struct WordsCountError {}

/// Decode a value from Big or Little Endian-ordered `Word`s.
pub trait Decode: Sized {
    fn from_be_words(words: &[Word]) -> std::result::Result<Self, WordsCountError>;
    fn from_le_words(words: &[Word]) -> std::result::Result<Self, WordsCountError>;
}

macro_rules! impl_decode {
    ($num_type:ty) => {
        impl Decode for $num_type {
            fn from_be_words(words: &[Word]) -> std::result::Result<Self, WordsCountError> {
                let bytes = words
                    .iter()
                    .copied()
                    .flat_map(u16::to_be_bytes)
                    .collect::<Vec<u8>>();
                let array = bytes.try_into().or(Err(WordsCountError {}))?;
                Ok(<$num_type>::from_be_bytes(array))
            }
            fn from_le_words(words: &[Word]) -> std::result::Result<Self, WordsCountError> {
                let reversed = words.iter().rev().copied().collect::<Vec<Word>>();
                Self::from_be_words(&reversed)
            }
        }
    };
}

impl_decode!(i16);
impl_decode!(i32);
impl_decode!(i64);
impl_decode!(u16);
impl_decode!(u32);
impl_decode!(u64);
impl_decode!(f32);
impl_decode!(f64);

/// Encode a value into Big or Little Endian-ordered `Word`s.
///
/// Little endian refers to the word order only, bytes inside a word stay big endian.
pub trait Encode {
    fn to_be_words(self) -> Vec<Word>;
    fn to_le_words(self) -> Vec<Word>;
}

macro_rules! impl_encode {
    ($num_type:ty) => {
        impl Encode for $num_type {
            fn to_be_words(self) -> Vec<Word> {
                self.to_be_bytes()
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect()
            }
            fn to_le_words(self) -> Vec<Word> {
                let mut words = self.to_be_words();
                words.reverse();
                words
            }
        }
    };
}

impl_encode!(i16);
impl_encode!(i32);
impl_encode!(i64);
impl_encode!(u16);
impl_encode!(u32);
impl_encode!(u64);
impl_encode!(f32);
impl_encode!(f64);

/// IEEE-754 binary16 bits for `value`, rounded to nearest even.
pub fn f16_bits_from_f32(value: f32) -> u16 {
    let x = value.to_bits();
    let sign = ((x >> 16) & 0x8000) as u16;
    let exp = ((x >> 23) & 0xff) as i32;
    let man = x & 0x007f_ffff;

    if exp == 0xff {
        let nan = if man != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 0x1f {
        return sign | 0x7c00;
    }
    if half_exp <= 0 {
        if half_exp < -10 {
            return sign;
        }
        let full = man | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let mut half_man = full >> shift;
        let rem = full & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        if rem > halfway || (rem == halfway && half_man & 1 == 1) {
            half_man += 1;
        }
        return sign | half_man as u16;
    }

    // A carry out of the mantissa rolls into the exponent, up to infinity.
    let mut half = ((half_exp as u32) << 10) | (man >> 13);
    let rem = man & 0x1fff;
    if rem > 0x1000 || (rem == 0x1000 && half & 1 == 1) {
        half += 1;
    }
    sign | half as u16
}

pub fn f32_from_f16_bits(bits: u16) -> f32 {
    let negative = bits & 0x8000 != 0;
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let man = (bits & 0x03ff) as u32;

    match (exp, man) {
        (0, 0) => f32::from_bits(sign),
        (0, _) => {
            let magnitude = man as f32 * 2f32.powi(-24);
            if negative {
                -magnitude
            } else {
                magnitude
            }
        }
        (0x1f, 0) => f32::from_bits(sign | 0x7f80_0000),
        (0x1f, _) => f32::from_bits(sign | 0x7fc0_0000 | (man << 13)),
        _ => f32::from_bits(sign | ((exp + 127 - 15) << 23) | (man << 13)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Declared type of a register value. The width comes from the word count.
pub enum DataType {
    Int,
    #[serde(rename = "uint")]
    UInt,
    Float,
    String,
}

impl DataType {
    /// Parse a data type name, either generic (`"int"`) or sized (`"int32"`).
    /// Sized names also yield their word count.
    pub fn parse_sized(name: &str) -> Result<(Self, Option<Quantity>)> {
        let parsed = match name.to_ascii_lowercase().as_str() {
            "int" => (DataType::Int, None),
            "int16" => (DataType::Int, Some(1)),
            "int32" => (DataType::Int, Some(2)),
            "int64" => (DataType::Int, Some(4)),
            "uint" => (DataType::UInt, None),
            "uint16" => (DataType::UInt, Some(1)),
            "uint32" => (DataType::UInt, Some(2)),
            "uint64" => (DataType::UInt, Some(4)),
            "float" => (DataType::Float, None),
            "float16" => (DataType::Float, Some(1)),
            "float32" => (DataType::Float, Some(2)),
            "float64" => (DataType::Float, Some(4)),
            "string" => (DataType::String, None),
            other => return Err(HubError::config(format!("unknown data type \"{other}\""))),
        };
        Ok(parsed)
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String)
    }

    fn check_count(&self, count: Quantity) -> Result<()> {
        match (self, count) {
            (DataType::String, 0) => Err(HubError::config("string needs at least one register")),
            (DataType::String, _) | (_, 1 | 2 | 4) => Ok(()),
            (ty, n) => Err(HubError::config(format!(
                "{ty} cannot span {n} registers, use 1, 2 or 4"
            ))),
        }
    }
}

impl FromStr for DataType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_sized(s).map(|(ty, _)| ty)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "int",
            DataType::UInt => "uint",
            DataType::Float => "float",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Post-processing of a big-endian word sequence for devices with other byte/word orders.
pub enum Swap {
    #[default]
    None,
    /// Swap the two bytes of every word.
    Byte,
    /// Reverse the word order.
    Word,
    /// Both of the above.
    WordByte,
}

impl Swap {
    /// Word swaps only make sense for values spanning several registers.
    pub fn validate(&self, data_type: DataType, count: Quantity) -> Result<()> {
        match self {
            Swap::Word | Swap::WordByte if data_type == DataType::String || count < 2 => {
                Err(HubError::config(format!(
                    "{self:?} swap is illegal for {data_type} over {count} register(s)"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Applying the same swap twice restores the original words.
    pub fn apply(&self, words: &mut [Word]) {
        if matches!(self, Swap::Byte | Swap::WordByte) {
            for word in words.iter_mut() {
                *word = word.swap_bytes();
            }
        }
        if matches!(self, Swap::Word | Swap::WordByte) {
            words.reverse();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Last known state of an entity, as handed over by the caller.
pub enum StateValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Unavailable,
}

impl StateValue {
    pub fn is_unavailable(&self) -> bool {
        match self {
            StateValue::Unavailable => true,
            StateValue::Text(text) => text == STATE_UNAVAILABLE,
            _ => false,
        }
    }

    /// Boolean reading of a state, as used for coil-like entities.
    pub fn is_truthy(&self) -> bool {
        match self {
            StateValue::Bool(b) => *b,
            StateValue::Int(v) => *v != 0,
            StateValue::UInt(v) => *v != 0,
            StateValue::Float(v) => *v != 0.0,
            StateValue::Text(text) => {
                let text = text.trim();
                ["on", "true", "open", "1"]
                    .iter()
                    .any(|truthy| text.eq_ignore_ascii_case(truthy))
            }
            StateValue::Unavailable => false,
        }
    }

    fn as_integer(&self) -> Result<i128> {
        match self {
            StateValue::Bool(b) => Ok(i128::from(*b)),
            StateValue::Int(v) => Ok(i128::from(*v)),
            StateValue::UInt(v) => Ok(i128::from(*v)),
            StateValue::Float(v) if v.is_finite() => Ok(v.trunc() as i128),
            StateValue::Float(v) => Err(HubError::config(format!("{v} is not an integer"))),
            StateValue::Text(text) => {
                let text = text.trim();
                text.parse::<i128>()
                    .or_else(|_| text.parse::<f64>().map(|v| v.trunc() as i128))
                    .map_err(|_| HubError::config(format!("\"{text}\" is not a number")))
            }
            StateValue::Unavailable => Ok(0),
        }
    }

    fn as_float(&self) -> Result<f64> {
        match self {
            StateValue::Bool(b) => Ok(f64::from(u8::from(*b))),
            StateValue::Int(v) => Ok(*v as f64),
            StateValue::UInt(v) => Ok(*v as f64),
            StateValue::Float(v) => Ok(*v),
            StateValue::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| HubError::config(format!("\"{text}\" is not a number"))),
            StateValue::Unavailable => Ok(0.0),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<u64> for StateValue {
    fn from(value: u64) -> Self {
        StateValue::UInt(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        if value == STATE_UNAVAILABLE {
            StateValue::Unavailable
        } else {
            StateValue::Text(value.to_owned())
        }
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::from(value.as_str())
    }
}

/// Encode `value` as `count` big-endian registers of type `data_type`.
///
/// Unsigned values wrap modulo the target width; signed values outside the
/// representable range are rejected. Strings are NUL padded or truncated to
/// exactly `2 * count` bytes.
pub fn build_registers(
    value: &StateValue,
    data_type: DataType,
    count: Quantity,
) -> Result<Vec<Word>> {
    data_type.check_count(count)?;

    if value.is_unavailable() {
        let fill = match data_type {
            DataType::String => 0x2020,
            _ => 0,
        };
        return Ok(vec![fill; count.into()]);
    }

    let words = match (data_type, count) {
        (DataType::Float, 1) => vec![f16_bits_from_f32(value.as_float()? as f32)],
        (DataType::Float, 2) => (value.as_float()? as f32).to_be_words(),
        (DataType::Float, _) => value.as_float()?.to_be_words(),
        (DataType::Int, count) => {
            let v = value.as_integer()?;
            let bits = 16 * u32::from(count);
            let min = -(1i128 << (bits - 1));
            let max = (1i128 << (bits - 1)) - 1;
            if v < min || v > max {
                return Err(HubError::config(format!(
                    "{v} does not fit a signed {bits}-bit register value"
                )));
            }
            match count {
                1 => (v as i16).to_be_words(),
                2 => (v as i32).to_be_words(),
                _ => (v as i64).to_be_words(),
            }
        }
        (DataType::UInt, count) => {
            let bits = 16 * u32::from(count);
            let v = value.as_integer()?.rem_euclid(1i128 << bits);
            match count {
                1 => (v as u16).to_be_words(),
                2 => (v as u32).to_be_words(),
                _ => (v as u64).to_be_words(),
            }
        }
        (DataType::String, count) => {
            let text = match value {
                StateValue::Text(text) => text.clone(),
                StateValue::Bool(b) => if *b { "on" } else { "off" }.to_owned(),
                StateValue::Int(v) => v.to_string(),
                StateValue::UInt(v) => v.to_string(),
                StateValue::Float(v) => v.to_string(),
                StateValue::Unavailable => String::new(),
            };
            let mut bytes = text.into_bytes();
            bytes.resize(2 * usize::from(count), 0);
            bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect()
        }
    };

    Ok(words)
}

/// Decode registers read from a device, after undoing `swap`.
///
/// The word count is taken from `words.len()`.
pub fn decode_registers(words: &[Word], data_type: DataType, swap: Swap) -> Result<StateValue> {
    let count = Quantity::try_from(words.len())
        .map_err(|_| HubError::config(format!("{} registers is too many", words.len())))?;
    data_type.check_count(count)?;
    swap.validate(data_type, count)?;

    let mut words = words.to_vec();
    swap.apply(&mut words);
    let width_error = |_| HubError::config(format!("{data_type} cannot span {count} registers"));

    let value = match (data_type, count) {
        (DataType::Float, 1) => StateValue::Float(f64::from(f32_from_f16_bits(words[0]))),
        (DataType::Float, 2) => {
            StateValue::Float(f64::from(f32::from_be_words(&words).map_err(width_error)?))
        }
        (DataType::Float, _) => StateValue::Float(f64::from_be_words(&words).map_err(width_error)?),
        (DataType::Int, 1) => {
            StateValue::Int(i16::from_be_words(&words).map_err(width_error)?.into())
        }
        (DataType::Int, 2) => {
            StateValue::Int(i32::from_be_words(&words).map_err(width_error)?.into())
        }
        (DataType::Int, _) => StateValue::Int(i64::from_be_words(&words).map_err(width_error)?),
        (DataType::UInt, 1) => {
            StateValue::UInt(u16::from_be_words(&words).map_err(width_error)?.into())
        }
        (DataType::UInt, 2) => {
            StateValue::UInt(u32::from_be_words(&words).map_err(width_error)?.into())
        }
        (DataType::UInt, _) => StateValue::UInt(u64::from_be_words(&words).map_err(width_error)?),
        (DataType::String, _) => {
            let bytes = words.iter().copied().flat_map(u16::to_be_bytes).collect::<Vec<u8>>();
            let text = String::from_utf8_lossy(&bytes);
            StateValue::Text(text.trim_end_matches(['\0', ' ']).to_owned())
        }
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: impl Into<StateValue>, ty: DataType, count: Quantity) -> Vec<Word> {
        build_registers(&value.into(), ty, count).unwrap()
    }

    fn decode(words: &[Word], ty: DataType) -> StateValue {
        decode_registers(words, ty, Swap::None).unwrap()
    }

    #[test]
    fn big_endian_ordering() {
        assert_eq!(encode(1u64, DataType::UInt, 1), vec![0x0001]);
        assert_eq!(encode(0x0102u64, DataType::UInt, 1), vec![0x0102]);
        assert_eq!(encode(0x0001_0002u64, DataType::UInt, 2), vec![0x0001, 0x0002]);
        assert_eq!(encode(123_456u64, DataType::UInt, 2), vec![0x0001, 0xE240]);
    }

    #[test]
    fn integer_round_trips() {
        let cases = [
            (-1i64, 1),
            (i16::MIN as i64, 1),
            (-70_000, 2),
            (i64::MIN, 4),
            (i64::MAX, 4),
        ];
        for (value, count) in cases {
            let words = encode(value, DataType::Int, count);
            assert_eq!(words.len(), usize::from(count));
            assert_eq!(decode(&words, DataType::Int), StateValue::Int(value));
        }
        for (value, count) in [(u16::MAX as u64, 1), (4_000_000_000, 2), (u64::MAX, 4)] {
            let words = encode(value, DataType::UInt, count);
            assert_eq!(decode(&words, DataType::UInt), StateValue::UInt(value));
        }
    }

    #[test]
    fn float_round_trips() {
        let words = encode(1234.5678901234_f64, DataType::Float, 4);
        assert_eq!(decode(&words, DataType::Float), StateValue::Float(1234.5678901234));

        let words = encode(-3.25_f64, DataType::Float, 2);
        assert_eq!(words, vec![0xC050, 0x0000]);
        assert_eq!(decode(&words, DataType::Float), StateValue::Float(-3.25));

        let words = encode(21.7_f64, DataType::Float, 2);
        let StateValue::Float(lossy) = decode(&words, DataType::Float) else {
            panic!("expected float");
        };
        assert!((lossy - 21.7).abs() < 1e-5);
    }

    #[test]
    fn float16_conversion() {
        assert_eq!(f16_bits_from_f32(1.0), 0x3C00);
        assert_eq!(f16_bits_from_f32(-2.0), 0xC000);
        assert_eq!(f16_bits_from_f32(65504.0), 0x7BFF);
        assert_eq!(f16_bits_from_f32(1.0e6), 0x7C00);
        assert_eq!(f16_bits_from_f32(5.960_464_5e-8), 0x0001);
        assert_eq!(f32_from_f16_bits(0x3555), 0.333_251_95);
        assert!(f32_from_f16_bits(0x7E00).is_nan());

        let words = encode(21.7_f64, DataType::Float, 1);
        let StateValue::Float(lossy) = decode(&words, DataType::Float) else {
            panic!("expected float");
        };
        assert!((lossy - 21.7).abs() < 0.02);
    }

    #[test]
    fn unavailable_is_zero_or_spaces() {
        for ty in [DataType::Int, DataType::UInt, DataType::Float] {
            for count in [1, 2, 4] {
                assert_eq!(encode(STATE_UNAVAILABLE, ty, count), vec![0; count.into()]);
            }
        }
        assert_eq!(encode(StateValue::Unavailable, DataType::String, 3), vec![0x2020; 3]);
    }

    #[test]
    fn signed_overflow_is_rejected() {
        assert!(build_registers(&StateValue::Int(32_768), DataType::Int, 1).is_err());
        assert!(build_registers(&StateValue::Int(-32_769), DataType::Int, 1).is_err());
        assert!(build_registers(&StateValue::Int(1 << 31), DataType::Int, 2).is_err());
        assert!(build_registers(&StateValue::UInt(u64::MAX), DataType::Int, 4).is_err());
        assert_eq!(encode(-32_768i64, DataType::Int, 1), vec![0x8000]);
    }

    #[test]
    fn unsigned_wraps_modulo_width() {
        assert_eq!(encode(-1i64, DataType::UInt, 1), vec![0xFFFF]);
        assert_eq!(encode(0x1_0002u64, DataType::UInt, 1), vec![0x0002]);
        assert_eq!(encode(-1i64, DataType::UInt, 4), vec![0xFFFF; 4]);
        assert_eq!(encode(1u64 << 32, DataType::UInt, 2), vec![0, 0]);
    }

    #[test]
    fn invalid_numeric_width_is_a_config_error() {
        for count in [0, 3, 5, 8] {
            let err = build_registers(&StateValue::Int(1), DataType::Int, count).unwrap_err();
            assert!(matches!(err, HubError::Config(_)));
        }
    }

    #[test]
    fn strings_fill_declared_width() {
        assert_eq!(encode("ab", DataType::String, 1), vec![0x6162]);
        assert_eq!(encode("abc", DataType::String, 2), vec![0x6162, 0x6300]);
        assert_eq!(encode("abcdef", DataType::String, 2), vec![0x6162, 0x6364]);
        assert_eq!(decode(&[0x6162, 0x6300], DataType::String), StateValue::Text("abc".into()));
        assert_eq!(decode(&[0x2020, 0x2020], DataType::String), StateValue::Text(String::new()));
    }

    #[test]
    fn text_states_are_parsed() {
        assert_eq!(encode("42", DataType::UInt, 1), vec![42]);
        assert_eq!(encode("-1.9", DataType::Int, 1), vec![0xFFFF]);
        assert!(build_registers(&"warm".into(), DataType::Float, 2).is_err());
    }

    #[test]
    fn swaps() {
        let mut words = vec![0x0102, 0x0304];
        Swap::Byte.apply(&mut words);
        assert_eq!(words, vec![0x0201, 0x0403]);

        let mut words = vec![0x0102, 0x0304];
        Swap::Word.apply(&mut words);
        assert_eq!(words, vec![0x0304, 0x0102]);

        let mut words = vec![0x0102, 0x0304];
        Swap::WordByte.apply(&mut words);
        assert_eq!(words, vec![0x0403, 0x0201]);

        assert_eq!(
            decode_registers(&[0xE240, 0x0001], DataType::UInt, Swap::Word).unwrap(),
            StateValue::UInt(123_456)
        );
        assert!(Swap::Word.validate(DataType::Int, 1).is_err());
        assert!(Swap::WordByte.validate(DataType::String, 4).is_err());
        assert!(Swap::Byte.validate(DataType::Int, 1).is_ok());
    }

    #[test]
    fn little_endian_word_order() {
        assert_eq!(0x0001_0002u32.to_le_words(), vec![0x0002, 0x0001]);
        assert_eq!(u32::from_le_words(&[0x0002, 0x0001]).unwrap(), 0x0001_0002);
        assert!(u32::from_be_words(&[1]).is_err());
    }

    #[test]
    fn sized_type_names() {
        assert_eq!(DataType::parse_sized("float32").unwrap(), (DataType::Float, Some(2)));
        assert_eq!(DataType::parse_sized("UINT64").unwrap(), (DataType::UInt, Some(4)));
        assert_eq!(DataType::parse_sized("string").unwrap(), (DataType::String, None));
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::Int);
        assert!(DataType::parse_sized("custom").is_err());
    }

    #[test]
    fn truthiness() {
        assert!(StateValue::from("on").is_truthy());
        assert!(StateValue::from("TRUE").is_truthy());
        assert!(!StateValue::from("off").is_truthy());
        assert!(!StateValue::from(STATE_UNAVAILABLE).is_truthy());
        assert!(StateValue::Float(0.5).is_truthy());
    }
}
