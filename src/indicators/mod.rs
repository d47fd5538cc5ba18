// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator computations over a candle series plus the
// request layer in front of them: a closed set of indicator kinds, each with a
// parameter schema, a parser for `NAME(a,b)` configuration strings and
// validation into a typed `IndicatorSpec`.
//
// Every output is aligned index-for-index with the input candles. Indices that
// cannot be computed yet (warm-up) or whose value would be non-finite are
// `None`.

pub mod bollinger;
pub mod cache;
pub mod kdj;
pub mod ma;
pub mod macd;
pub mod rsi;
pub mod volume;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::market_data::candle_series::Candle;

pub use cache::IndicatorCache;

/// Map non-finite intermediate results to the null sentinel.
#[inline]
pub(crate) fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

// =============================================================================
// Kinds and parameter schemas
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndicatorKind {
    Ma,
    Ema,
    Boll,
    Macd,
    Rsi,
    Kdj,
    Vol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Integer,
    Float,
}

/// One entry of an indicator's parameter schema.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: ParamValue,
    pub min: f64,
}

const fn int_param(name: &'static str, default: i64, min: f64) -> ParamSpec {
    ParamSpec {
        name,
        kind: ParamKind::Integer,
        default: ParamValue::Int(default),
        min,
    }
}

const MA_SCHEMA: &[ParamSpec] = &[int_param("period", 5, 1.0)];
const EMA_SCHEMA: &[ParamSpec] = &[int_param("period", 12, 1.0)];
const BOLL_SCHEMA: &[ParamSpec] = &[
    int_param("period", 20, 2.0),
    ParamSpec {
        name: "multiplier",
        kind: ParamKind::Float,
        default: ParamValue::Float(2.0),
        min: 0.1,
    },
];
const MACD_SCHEMA: &[ParamSpec] = &[
    int_param("short", 12, 2.0),
    int_param("long", 26, 2.0),
    int_param("signal", 9, 1.0),
];
const RSI_SCHEMA: &[ParamSpec] = &[int_param("period", 14, 1.0)];
const KDJ_SCHEMA: &[ParamSpec] = &[
    int_param("period", 9, 1.0),
    int_param("k", 3, 1.0),
    int_param("d", 3, 1.0),
];
const VOL_SCHEMA: &[ParamSpec] = &[int_param("period", 5, 1.0)];

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 7] = [
        Self::Ma,
        Self::Ema,
        Self::Boll,
        Self::Macd,
        Self::Rsi,
        Self::Kdj,
        Self::Vol,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ma => "MA",
            Self::Ema => "EMA",
            Self::Boll => "BOLL",
            Self::Macd => "MACD",
            Self::Rsi => "RSI",
            Self::Kdj => "KDJ",
            Self::Vol => "VOL",
        }
    }

    /// Parameters in positional order.
    pub fn schema(&self) -> &'static [ParamSpec] {
        match self {
            Self::Ma => MA_SCHEMA,
            Self::Ema => EMA_SCHEMA,
            Self::Boll => BOLL_SCHEMA,
            Self::Macd => MACD_SCHEMA,
            Self::Rsi => RSI_SCHEMA,
            Self::Kdj => KDJ_SCHEMA,
            Self::Vol => VOL_SCHEMA,
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndicatorKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ValidationError::UnknownIndicator(wanted.to_string()))
    }
}

// =============================================================================
// Requests
// =============================================================================

/// A raw parameter value. JSON integers deserialize as `Int`, everything else
/// numeric as `Float`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

/// An unvalidated request: a kind plus named parameters. Parameters that are
/// not given take their schema default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRequest {
    pub kind: IndicatorKind,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl IndicatorRequest {
    pub fn new(kind: IndicatorKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Parse `NAME` or `NAME(a, b, ...)`. The name is case-insensitive and
    /// positional values map onto the schema in order.
    pub fn parse(config: &str) -> Result<Self, ValidationError> {
        let config = config.trim();
        let (name, args) = match config.find('(') {
            Some(open) => {
                let inner = config[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| ValidationError::Syntax(config.to_string()))?;
                (&config[..open], Some(inner))
            }
            None => (config, None),
        };
        if name.trim().is_empty() || args.is_some_and(|a| a.contains('(') || a.contains(')')) {
            return Err(ValidationError::Syntax(config.to_string()));
        }

        let kind: IndicatorKind = name.parse()?;
        let mut request = Self::new(kind);

        let args: Vec<&str> = match args.map(str::trim) {
            None | Some("") => Vec::new(),
            Some(inner) => inner.split(',').map(str::trim).collect(),
        };

        let schema = kind.schema();
        if args.len() > schema.len() {
            return Err(ValidationError::TooManyParameters {
                indicator: kind.name(),
                expected: schema.len(),
                got: args.len(),
            });
        }

        for (param, raw) in schema.iter().zip(args) {
            if raw.is_empty() {
                return Err(ValidationError::Syntax(config.to_string()));
            }
            let value = if let Ok(v) = raw.parse::<i64>() {
                ParamValue::Int(v)
            } else {
                match raw.parse::<f64>() {
                    Ok(v) if v.is_finite() => ParamValue::Float(v),
                    _ => {
                        return Err(ValidationError::NotNumeric {
                            indicator: kind.name(),
                            name: param.name,
                            value: raw.to_string(),
                        })
                    }
                }
            };
            request.params.insert(param.name.to_string(), value);
        }

        Ok(request)
    }

    /// Check every parameter against the schema and resolve defaults.
    pub fn validate(&self) -> Result<IndicatorSpec, ValidationError> {
        let kind = self.kind;
        let indicator = kind.name();
        let schema = kind.schema();

        if let Some(unknown) = self
            .params
            .keys()
            .find(|name| !schema.iter().any(|p| p.name == name.as_str()))
        {
            return Err(ValidationError::UnknownParameter {
                indicator,
                name: unknown.clone(),
            });
        }

        let mut values = Vec::with_capacity(schema.len());
        for param in schema {
            let value = self.params.get(param.name).copied().unwrap_or(param.default);
            if param.kind == ParamKind::Integer && !matches!(value, ParamValue::Int(_)) {
                return Err(ValidationError::WrongType {
                    indicator,
                    name: param.name,
                });
            }
            let numeric = value.as_f64();
            if !numeric.is_finite() {
                return Err(ValidationError::NotNumeric {
                    indicator,
                    name: param.name,
                    value: numeric.to_string(),
                });
            }
            if numeric < param.min {
                return Err(ValidationError::BelowMinimum {
                    indicator,
                    name: param.name,
                    value: numeric,
                    min: param.min,
                });
            }
            values.push(numeric);
        }

        // Integer parameters are whole and at least 1 by now.
        let int = |i: usize| values[i] as usize;

        let spec = match kind {
            IndicatorKind::Ma => IndicatorSpec::Ma { period: int(0) },
            IndicatorKind::Ema => IndicatorSpec::Ema { period: int(0) },
            IndicatorKind::Boll => IndicatorSpec::Boll {
                period: int(0),
                multiplier: values[1],
            },
            IndicatorKind::Macd => {
                let (short, long) = (int(0), int(1));
                if short >= long {
                    return Err(ValidationError::Inconsistent {
                        indicator,
                        name: "short",
                        reason: format!("({short}) must be less than long ({long})"),
                    });
                }
                IndicatorSpec::Macd {
                    short,
                    long,
                    signal: int(2),
                }
            }
            IndicatorKind::Rsi => IndicatorSpec::Rsi { period: int(0) },
            IndicatorKind::Kdj => IndicatorSpec::Kdj {
                period: int(0),
                k: int(1),
                d: int(2),
            },
            IndicatorKind::Vol => IndicatorSpec::Vol { period: int(0) },
        };
        Ok(spec)
    }
}

impl FromStr for IndicatorRequest {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Validated specs
// =============================================================================

/// A validated request with resolved, typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum IndicatorSpec {
    Ma { period: usize },
    Ema { period: usize },
    Boll { period: usize, multiplier: f64 },
    Macd { short: usize, long: usize, signal: usize },
    Rsi { period: usize },
    Kdj { period: usize, k: usize, d: usize },
    Vol { period: usize },
}

// The multiplier is finite after validation, so bitwise identity is equality.
impl Eq for IndicatorSpec {}

impl Hash for IndicatorSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match *self {
            Self::Ma { period }
            | Self::Ema { period }
            | Self::Rsi { period }
            | Self::Vol { period } => period.hash(state),
            Self::Boll { period, multiplier } => {
                period.hash(state);
                multiplier.to_bits().hash(state);
            }
            Self::Macd {
                short,
                long,
                signal,
            } => {
                short.hash(state);
                long.hash(state);
                signal.hash(state);
            }
            Self::Kdj { period, k, d } => {
                period.hash(state);
                k.hash(state);
                d.hash(state);
            }
        }
    }
}

impl IndicatorSpec {
    pub fn kind(&self) -> IndicatorKind {
        match self {
            Self::Ma { .. } => IndicatorKind::Ma,
            Self::Ema { .. } => IndicatorKind::Ema,
            Self::Boll { .. } => IndicatorKind::Boll,
            Self::Macd { .. } => IndicatorKind::Macd,
            Self::Rsi { .. } => IndicatorKind::Rsi,
            Self::Kdj { .. } => IndicatorKind::Kdj,
            Self::Vol { .. } => IndicatorKind::Vol,
        }
    }

    /// Run the computation over `candles` (oldest first).
    pub fn compute(&self, candles: &[Candle]) -> IndicatorOutput {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        match *self {
            Self::Ma { period } => IndicatorOutput::Line {
                values: ma::sma(&closes, period),
            },
            Self::Ema { period } => IndicatorOutput::Line {
                values: ma::ema(&closes, period),
            },
            Self::Boll { period, multiplier } => {
                let bands = bollinger::bollinger(&closes, period, multiplier);
                IndicatorOutput::Bands {
                    upper: bands.upper,
                    mid: bands.mid,
                    lower: bands.lower,
                }
            }
            Self::Macd {
                short,
                long,
                signal,
            } => {
                let m = macd::macd(&closes, short, long, signal);
                IndicatorOutput::Macd {
                    dif: m.dif,
                    dea: m.dea,
                    histogram: m.histogram,
                }
            }
            Self::Rsi { period } => IndicatorOutput::Line {
                values: rsi::rsi(&closes, period),
            },
            Self::Kdj { period, k, d } => {
                let out = kdj::kdj(candles, period, k, d);
                IndicatorOutput::Kdj {
                    k: out.k,
                    d: out.d,
                    j: out.j,
                }
            }
            Self::Vol { period } => {
                let out = volume::volume(candles, period);
                IndicatorOutput::Volume {
                    volume: out.volume,
                    ma: out.ma,
                }
            }
        }
    }
}

impl fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Ma { period } => write!(f, "MA({period})"),
            Self::Ema { period } => write!(f, "EMA({period})"),
            Self::Boll { period, multiplier } => write!(f, "BOLL({period},{multiplier})"),
            Self::Macd {
                short,
                long,
                signal,
            } => write!(f, "MACD({short},{long},{signal})"),
            Self::Rsi { period } => write!(f, "RSI({period})"),
            Self::Kdj { period, k, d } => write!(f, "KDJ({period},{k},{d})"),
            Self::Vol { period } => write!(f, "VOL({period})"),
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorOutput {
    Line {
        values: Vec<Option<f64>>,
    },
    Bands {
        upper: Vec<Option<f64>>,
        mid: Vec<Option<f64>>,
        lower: Vec<Option<f64>>,
    },
    Macd {
        dif: Vec<Option<f64>>,
        dea: Vec<Option<f64>>,
        histogram: Vec<Option<f64>>,
    },
    Kdj {
        k: Vec<Option<f64>>,
        d: Vec<Option<f64>>,
        j: Vec<Option<f64>>,
    },
    Volume {
        volume: Vec<Option<f64>>,
        ma: Vec<Option<f64>>,
    },
}

impl IndicatorOutput {
    /// Every line of the output, in declaration order.
    pub fn lines(&self) -> Vec<&[Option<f64>]> {
        match self {
            Self::Line { values } => vec![values.as_slice()],
            Self::Bands { upper, mid, lower } => {
                vec![upper.as_slice(), mid.as_slice(), lower.as_slice()]
            }
            Self::Macd {
                dif,
                dea,
                histogram,
            } => vec![dif.as_slice(), dea.as_slice(), histogram.as_slice()],
            Self::Kdj { k, d, j } => vec![k.as_slice(), d.as_slice(), j.as_slice()],
            Self::Volume { volume, ma } => vec![volume.as_slice(), ma.as_slice()],
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(i as i64 * 60_000, c, c + 1.0, c - 1.0, c, 10.0 + i as f64))
            .collect()
    }

    // ---- parsing ---------------------------------------------------------

    #[test]
    fn parse_boll_positional() {
        let request = IndicatorRequest::parse("BOLL(5,2)").unwrap();
        assert_eq!(request.kind, IndicatorKind::Boll);
        assert_eq!(
            request.validate().unwrap(),
            IndicatorSpec::Boll {
                period: 5,
                multiplier: 2.0
            }
        );
    }

    #[test]
    fn parse_is_case_insensitive_and_fills_defaults() {
        assert_eq!(
            "macd".parse::<IndicatorRequest>().unwrap().validate().unwrap(),
            IndicatorSpec::Macd {
                short: 12,
                long: 26,
                signal: 9
            }
        );
        assert_eq!(
            IndicatorRequest::parse(" kdj( 14 ) ").unwrap().validate().unwrap(),
            IndicatorSpec::Kdj {
                period: 14,
                k: 3,
                d: 3
            }
        );
        assert_eq!(
            IndicatorRequest::parse("MA()").unwrap().validate().unwrap(),
            IndicatorSpec::Ma { period: 5 }
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            IndicatorRequest::parse("FOO(3)"),
            Err(ValidationError::UnknownIndicator(name)) if name == "FOO"
        ));
        assert!(matches!(
            IndicatorRequest::parse("MA(3"),
            Err(ValidationError::Syntax(_))
        ));
        assert!(matches!(
            IndicatorRequest::parse("MA(3,4)"),
            Err(ValidationError::TooManyParameters { expected: 1, got: 2, .. })
        ));
        assert!(matches!(
            IndicatorRequest::parse("RSI(abc)"),
            Err(ValidationError::NotNumeric { name: "period", .. })
        ));
        assert!(matches!(
            IndicatorRequest::parse("BOLL(20,)"),
            Err(ValidationError::Syntax(_))
        ));
    }

    // ---- validation ------------------------------------------------------

    #[test]
    fn validation_names_offending_parameter() {
        assert!(matches!(
            IndicatorRequest::parse("MA(0)").unwrap().validate(),
            Err(ValidationError::BelowMinimum { name: "period", .. })
        ));
        assert!(matches!(
            IndicatorRequest::parse("EMA(2.5)").unwrap().validate(),
            Err(ValidationError::WrongType { name: "period", .. })
        ));
        assert!(matches!(
            IndicatorRequest::parse("BOLL(20,0.05)").unwrap().validate(),
            Err(ValidationError::BelowMinimum { name: "multiplier", .. })
        ));
        assert!(matches!(
            IndicatorRequest::parse("MACD(26,12,9)").unwrap().validate(),
            Err(ValidationError::Inconsistent { name: "short", .. })
        ));
        let unknown = IndicatorRequest::new(IndicatorKind::Rsi).with("length", ParamValue::Int(3));
        assert!(matches!(
            unknown.validate(),
            Err(ValidationError::UnknownParameter { name, .. }) if name == "length"
        ));
    }

    #[test]
    fn integer_accepted_for_float_parameter() {
        let request = IndicatorRequest::new(IndicatorKind::Boll)
            .with("period", ParamValue::Int(10))
            .with("multiplier", ParamValue::Int(3));
        assert_eq!(
            request.validate().unwrap(),
            IndicatorSpec::Boll {
                period: 10,
                multiplier: 3.0
            }
        );
    }

    #[test]
    fn request_deserialises_from_json() {
        let request: IndicatorRequest =
            serde_json::from_str(r#"{ "kind": "BOLL", "params": { "period": 10, "multiplier": 1.5 } }"#)
                .unwrap();
        assert_eq!(request.params["period"], ParamValue::Int(10));
        assert_eq!(request.params["multiplier"], ParamValue::Float(1.5));
    }

    #[test]
    fn spec_display_round_trips_through_parser() {
        for config in ["MA(7)", "BOLL(20,2.5)", "MACD(5,35,5)", "KDJ(9,3,3)", "VOL(10)"] {
            let spec = IndicatorRequest::parse(config).unwrap().validate().unwrap();
            assert_eq!(spec.to_string(), config);
        }
    }

    // ---- dispatch --------------------------------------------------------

    #[test]
    fn every_kind_preserves_input_length() {
        let series = candles(&(1..=40).map(|x| 100.0 + (x as f64).sin()).collect::<Vec<_>>());
        for kind in IndicatorKind::ALL {
            let spec = IndicatorRequest::new(kind).validate().unwrap();
            let out = spec.compute(&series);
            for line in out.lines() {
                assert_eq!(line.len(), series.len(), "{spec}");
            }
        }
    }

    #[test]
    fn compute_on_empty_series() {
        for kind in IndicatorKind::ALL {
            let spec = IndicatorRequest::new(kind).validate().unwrap();
            assert!(spec.compute(&[]).lines().iter().all(|l| l.is_empty()));
        }
    }
}
