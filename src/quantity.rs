//! Named instrument parameters.
//!
//! A [`Quantity`] is one parameter of an instrument (`Frequency`, `Output`,
//! `Trace`, ...): a cached value, an optional unit and channel, and the
//! command templates used to read and write it. Templates are `strfmt`
//! strings such as `"SOUR{ch}:FREQ {value}"`; the fields available are the
//! quantity defaults (`value`, `unit`, `ch`), whatever the caller puts in the
//! [`CommandContext`], and `option` for enumerated writes.
//!
//! The encode/decode rules live in one place per [`QuantityKind`]:
//!
//! | Kind | Read | Write |
//! |---|---|---|
//! | Real, Integer | first ASCII value | scalar into the template |
//! | String | raw reply, quotes and blanks stripped | text into the template |
//! | Option | reply mapped through the label/code table | label checked, code in `{option}` |
//! | Bool | ASCII value, non-zero is `true` | `0` or `1` |
//! | Vector | ASCII values, or a binary block when the context asks for one | not supported |
//! | List | cached only | not supported |
//!
//! Quantities never hold a reference to their driver. The driver lends its
//! session for each call; without one, reads return the cache and writes only
//! update it.

use crate::block::BinaryFormat;
use crate::error::{DriverError, DriverResult};
use crate::session::MessageSession;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Value held by a quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuantityValue {
    /// On or off.
    Bool(bool),
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Real(f64),
    /// Text, also used for Option labels.
    String(String),
    /// Numeric array such as a trace.
    Vector(Vec<f64>),
    /// Heterogeneous list, kept in the cache only.
    List(Vec<QuantityValue>),
}

impl QuantityValue {
    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QuantityValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            QuantityValue::Integer(i) => Some(*i as f64),
            QuantityValue::Real(r) => Some(*r),
            QuantityValue::String(s) => s.trim().parse().ok(),
            QuantityValue::Vector(_) | QuantityValue::List(_) => None,
        }
    }

    /// Text of a `String` value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            QuantityValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truth value; numbers are true when non-zero, text accepts
    /// `1`/`ON`/`TRUE` and `0`/`OFF`/`FALSE`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            QuantityValue::Bool(b) => Some(*b),
            QuantityValue::Integer(i) => Some(*i != 0),
            QuantityValue::Real(r) => Some(*r != 0.0),
            QuantityValue::String(s) => match s.trim().to_ascii_uppercase().as_str() {
                "1" | "ON" | "TRUE" => Some(true),
                "0" | "OFF" | "FALSE" => Some(false),
                _ => None,
            },
            QuantityValue::Vector(_) | QuantityValue::List(_) => None,
        }
    }

    /// Samples of a `Vector` value.
    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            QuantityValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for QuantityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityValue::Bool(b) => write!(f, "{b}"),
            QuantityValue::Integer(i) => write!(f, "{i}"),
            QuantityValue::Real(r) => f.write_str(&format_general(*r)),
            QuantityValue::String(s) => f.write_str(s),
            QuantityValue::Vector(v) => {
                let items: Vec<String> = v.iter().map(|x| format_general(*x)).collect();
                write!(f, "[{}]", items.join(", "))
            }
            QuantityValue::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl From<f64> for QuantityValue {
    fn from(v: f64) -> Self {
        QuantityValue::Real(v)
    }
}

impl From<i64> for QuantityValue {
    fn from(v: i64) -> Self {
        QuantityValue::Integer(v)
    }
}

impl From<i32> for QuantityValue {
    fn from(v: i32) -> Self {
        QuantityValue::Integer(i64::from(v))
    }
}

impl From<bool> for QuantityValue {
    fn from(v: bool) -> Self {
        QuantityValue::Bool(v)
    }
}

impl From<&str> for QuantityValue {
    fn from(v: &str) -> Self {
        QuantityValue::String(v.to_string())
    }
}

impl From<String> for QuantityValue {
    fn from(v: String) -> Self {
        QuantityValue::String(v)
    }
}

impl From<Vec<f64>> for QuantityValue {
    fn from(v: Vec<f64>) -> Self {
        QuantityValue::Vector(v)
    }
}

/// A field substituted into a command template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    /// Whole number, such as a channel.
    Integer(i64),
    /// Floating-point number.
    Real(f64),
    /// Text.
    Text(String),
}

impl TemplateValue {
    fn from_value(value: &QuantityValue) -> Option<Self> {
        match value {
            QuantityValue::Bool(b) => Some(TemplateValue::Integer(i64::from(*b))),
            QuantityValue::Integer(i) => Some(TemplateValue::Integer(*i)),
            QuantityValue::Real(r) => Some(TemplateValue::Real(*r)),
            QuantityValue::String(s) => Some(TemplateValue::Text(s.clone())),
            QuantityValue::Vector(_) | QuantityValue::List(_) => None,
        }
    }

    /// Integer view; reals are truncated, text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TemplateValue::Integer(i) => Some(*i),
            TemplateValue::Real(r) => Some(*r as i64),
            TemplateValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl strfmt::DisplayStr for TemplateValue {
    fn display_str(&self, f: &mut strfmt::Formatter) -> strfmt::Result<()> {
        match self {
            TemplateValue::Integer(i) => f.i64(*i),
            TemplateValue::Real(r) => f.f64(*r),
            TemplateValue::Text(s) => f.str(s),
        }
    }
}

impl From<i64> for TemplateValue {
    fn from(v: i64) -> Self {
        TemplateValue::Integer(v)
    }
}

impl From<i32> for TemplateValue {
    fn from(v: i32) -> Self {
        TemplateValue::Integer(i64::from(v))
    }
}

impl From<f64> for TemplateValue {
    fn from(v: f64) -> Self {
        TemplateValue::Real(v)
    }
}

impl From<&str> for TemplateValue {
    fn from(v: &str) -> Self {
        TemplateValue::Text(v.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(v: String) -> Self {
        TemplateValue::Text(v)
    }
}

/// Per-call fields merged over a quantity's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandContext {
    /// Template fields, such as `ch`.
    pub fields: BTreeMap<String, TemplateValue>,
    /// Read vectors as a binary block in this format instead of ASCII.
    pub binary: Option<BinaryFormat>,
}

impl CommandContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with `fields` and ASCII transfers.
    pub fn from_fields(fields: BTreeMap<String, TemplateValue>) -> Self {
        Self {
            fields,
            binary: None,
        }
    }

    /// Sets template field `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Requests binary block transfers in `format`.
    pub fn binary(mut self, format: BinaryFormat) -> Self {
        self.binary = Some(format);
        self
    }

    /// Template field `key`.
    pub fn get(&self, key: &str) -> Option<&TemplateValue> {
        self.fields.get(key)
    }

    /// Channel given by the caller, if any.
    pub fn ch(&self) -> Option<i64> {
        self.fields.get("ch").and_then(TemplateValue::as_i64)
    }
}

/// The closed set of quantity kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuantityKind {
    /// Floating-point scalar.
    Real,
    /// Integer scalar.
    Integer,
    /// Free text.
    String,
    /// Enumerated value; each entry is `(label, instrument code)`.
    Option {
        /// Allowed labels with their codes.
        #[serde(default)]
        options: Vec<(String, String)>,
    },
    /// Boolean sent as `0` or `1`.
    Bool,
    /// Numeric array.
    Vector,
    /// Heterogeneous list.
    List,
}

impl QuantityKind {
    /// Kind name as written in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            QuantityKind::Real => "Real",
            QuantityKind::Integer => "Integer",
            QuantityKind::String => "String",
            QuantityKind::Option { .. } => "Option",
            QuantityKind::Bool => "Bool",
            QuantityKind::Vector => "Vector",
            QuantityKind::List => "List",
        }
    }
}

/// A named, typed instrument parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Unique name within a driver.
    pub name: String,
    /// Value kind, with the option table for `Option`.
    #[serde(flatten)]
    pub kind: QuantityKind,
    /// Cached value.
    #[serde(default)]
    pub value: Option<QuantityValue>,
    /// Display unit.
    #[serde(default)]
    pub unit: Option<String>,
    /// Default channel for templates.
    #[serde(default)]
    pub ch: Option<i64>,
    /// Read template; empty means cache-only reads.
    #[serde(default)]
    pub get_cmd: String,
    /// Write template; empty means cache-only writes.
    #[serde(default)]
    pub set_cmd: String,
}

impl Quantity {
    /// Quantity with no value, unit, channel or templates.
    pub fn new(name: impl Into<String>, kind: QuantityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            value: None,
            unit: None,
            ch: None,
            get_cmd: String::new(),
            set_cmd: String::new(),
        }
    }

    /// `Real` quantity.
    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::Real)
    }

    /// `Integer` quantity.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::Integer)
    }

    /// `String` quantity.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::String)
    }

    /// `Option` quantity over `(label, code)` pairs.
    pub fn option(name: impl Into<String>, options: &[(&str, &str)]) -> Self {
        let options = options
            .iter()
            .map(|(label, code)| (label.to_string(), code.to_string()))
            .collect();
        Self::new(name, QuantityKind::Option { options })
    }

    /// `Bool` quantity.
    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::Bool)
    }

    /// `Vector` quantity.
    pub fn vector(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::Vector)
    }

    /// `List` quantity.
    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, QuantityKind::List)
    }

    /// Sets the initial cached value.
    pub fn with_value(mut self, value: impl Into<QuantityValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Sets the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Sets the default channel.
    pub fn with_ch(mut self, ch: i64) -> Self {
        self.ch = Some(ch);
        self
    }

    /// Sets the read template.
    pub fn with_get_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.get_cmd = cmd.into();
        self
    }

    /// Sets the write template.
    pub fn with_set_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.set_cmd = cmd.into();
        self
    }

    /// Reads the quantity.
    ///
    /// Without a session or a read command this is the cached value. Otherwise
    /// the instrument is queried and the decoded reply replaces the cache.
    pub async fn get_value(
        &mut self,
        session: Option<&mut MessageSession>,
        ctx: &CommandContext,
    ) -> DriverResult<Option<QuantityValue>> {
        let Some(session) = session else {
            return Ok(self.value.clone());
        };
        if self.get_cmd.is_empty() || self.kind == QuantityKind::List {
            return Ok(self.value.clone());
        }

        let cmd = self.format_get_cmd(ctx)?;
        let value = match &self.kind {
            QuantityKind::Real => QuantityValue::Real(self.first_value(session, &cmd).await?),
            QuantityKind::Integer => {
                QuantityValue::Integer(self.first_value(session, &cmd).await? as i64)
            }
            QuantityKind::Bool => {
                QuantityValue::Bool(self.first_value(session, &cmd).await? as i64 != 0)
            }
            QuantityKind::String => QuantityValue::String(strip_reply(&session.query(&cmd).await?)),
            QuantityKind::Option { options } => {
                let reply = strip_reply(&session.query(&cmd).await?);
                QuantityValue::String(decode_option(&self.name, options, &reply)?)
            }
            QuantityKind::Vector => match ctx.binary {
                Some(format) => QuantityValue::Vector(session.query_binary_values(&cmd, format).await?),
                None => QuantityValue::Vector(session.query_ascii_values(&cmd).await?),
            },
            QuantityKind::List => return Ok(self.value.clone()),
        };

        self.value = Some(value.clone());
        Ok(Some(value))
    }

    /// Writes the quantity.
    ///
    /// The cache is updated before anything is sent. The one exception is a
    /// value that cannot be coerced to this quantity's kind: that returns
    /// [`DriverError::InvalidValue`] and the cache keeps its previous value.
    /// An Option label outside the declared set is cached but never written.
    pub async fn set_value(
        &mut self,
        session: Option<&mut MessageSession>,
        value: QuantityValue,
        ctx: &CommandContext,
    ) -> DriverResult<()> {
        let value = self.coerce(value)?;
        self.value = Some(value.clone());

        let Some(session) = session else {
            return Ok(());
        };
        if self.set_cmd.is_empty() {
            return Ok(());
        }

        let mut fields = HashMap::new();
        match (&self.kind, &value) {
            (QuantityKind::Option { options }, QuantityValue::String(label)) => {
                let Some((_, code)) = options.iter().find(|(l, _)| l == label) else {
                    debug!(
                        parent: session.span(),
                        quantity = %self.name,
                        value = %label,
                        "Value not in options, write skipped"
                    );
                    return Ok(());
                };
                fields.insert("value".to_string(), TemplateValue::Text(label.clone()));
                fields.insert("option".to_string(), TemplateValue::Text(code.clone()));
            }
            (QuantityKind::Vector | QuantityKind::List, _) => {
                return Err(DriverError::Unsupported(format!(
                    "writing {} quantity '{}' through a command template",
                    self.kind.name(),
                    self.name
                )));
            }
            (_, value) => {
                if let Some(v) = TemplateValue::from_value(value) {
                    fields.insert("value".to_string(), v);
                }
            }
        }

        let cmd = self.format_set_cmd(fields, ctx)?;
        session.write(&cmd).await
    }

    /// Renders the read command for `ctx`.
    pub fn format_get_cmd(&self, ctx: &CommandContext) -> DriverResult<String> {
        render(&self.get_cmd, self.template_fields(ctx))
    }

    /// Renders the write command; `value_fields` override everything else.
    pub fn format_set_cmd(
        &self,
        value_fields: HashMap<String, TemplateValue>,
        ctx: &CommandContext,
    ) -> DriverResult<String> {
        let mut fields = self.template_fields(ctx);
        fields.extend(value_fields);
        render(&self.set_cmd, fields)
    }

    /// Position of the cached label in an Option table.
    pub fn index(&self) -> Option<usize> {
        let QuantityKind::Option { options } = &self.kind else {
            return None;
        };
        let label = self.value.as_ref()?.as_str()?;
        options.iter().position(|(l, _)| l == label)
    }

    /// Instrument code of the cached label in an Option table.
    pub fn cmd_option(&self) -> Option<&str> {
        let QuantityKind::Option { options } = &self.kind else {
            return None;
        };
        let label = self.value.as_ref()?.as_str()?;
        options
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, code)| code.as_str())
    }

    fn template_fields(&self, ctx: &CommandContext) -> HashMap<String, TemplateValue> {
        let mut fields = HashMap::new();
        if let Some(v) = self.value.as_ref().and_then(TemplateValue::from_value) {
            fields.insert("value".to_string(), v);
        }
        if let Some(unit) = &self.unit {
            fields.insert("unit".to_string(), TemplateValue::Text(unit.clone()));
        }
        if let Some(ch) = self.ch {
            fields.insert("ch".to_string(), TemplateValue::Integer(ch));
        }
        fields.extend(ctx.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields
    }

    async fn first_value(&self, session: &mut MessageSession, cmd: &str) -> DriverResult<f64> {
        session
            .query_ascii_values(cmd)
            .await?
            .first()
            .copied()
            .ok_or_else(|| DriverError::parse(format!("empty reply to '{cmd}' for '{}'", self.name)))
    }

    fn coerce(&self, value: QuantityValue) -> DriverResult<QuantityValue> {
        let invalid = |reason: &str| DriverError::InvalidValue {
            quantity: self.name.clone(),
            reason: format!("{reason}, got {value:?}"),
        };
        let coerced = match &self.kind {
            QuantityKind::Real => {
                QuantityValue::Real(value.as_f64().ok_or_else(|| invalid("expected a number"))?)
            }
            QuantityKind::Integer => {
                let exact = match &value {
                    QuantityValue::Integer(i) => Some(*i),
                    QuantityValue::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                match exact {
                    Some(i) => QuantityValue::Integer(i),
                    None => QuantityValue::Integer(
                        value.as_f64().ok_or_else(|| invalid("expected an integer"))? as i64,
                    ),
                }
            }
            QuantityKind::Bool => {
                QuantityValue::Bool(value.as_bool().ok_or_else(|| invalid("expected a boolean"))?)
            }
            QuantityKind::String | QuantityKind::Option { .. } => match &value {
                QuantityValue::String(_) => value.clone(),
                QuantityValue::Vector(_) | QuantityValue::List(_) => {
                    return Err(invalid("expected text"));
                }
                other => QuantityValue::String(other.to_string()),
            },
            QuantityKind::Vector => match &value {
                QuantityValue::Vector(_) => value.clone(),
                QuantityValue::List(items) => QuantityValue::Vector(
                    items
                        .iter()
                        .map(QuantityValue::as_f64)
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| invalid("expected numbers"))?,
                ),
                _ => return Err(invalid("expected a sequence of numbers")),
            },
            QuantityKind::List => match &value {
                QuantityValue::List(_) => value.clone(),
                QuantityValue::Vector(v) => {
                    QuantityValue::List(v.iter().map(|x| QuantityValue::Real(*x)).collect())
                }
                _ => return Err(invalid("expected a list")),
            },
        };
        Ok(coerced)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(value) = &self.value else {
            return f.write_str("None");
        };
        match (&self.kind, value, &self.unit) {
            (QuantityKind::Real | QuantityKind::Integer, v, Some(unit)) => match v.as_f64() {
                Some(x) => {
                    let (prefix, scale) = si_prefix(x);
                    write!(f, "{} {}{}", format_general(x / scale), prefix, unit)
                }
                None => write!(f, "{v}"),
            },
            (_, v, _) => write!(f, "{v}"),
        }
    }
}

fn render(template: &str, fields: HashMap<String, TemplateValue>) -> DriverResult<String> {
    strfmt::strfmt(template, &fields).map_err(|source| DriverError::Template {
        template: template.to_string(),
        source,
    })
}

fn strip_reply(reply: &str) -> String {
    reply
        .trim_matches(|c| matches!(c, '\n' | '"' | '\'' | ' '))
        .to_string()
}

fn decode_option(name: &str, options: &[(String, String)], reply: &str) -> DriverResult<String> {
    options
        .iter()
        .find(|(_, code)| code == reply)
        .or_else(|| options.iter().find(|(label, _)| label == reply))
        .or_else(|| options.iter().find(|(_, code)| code.eq_ignore_ascii_case(reply)))
        .map(|(label, _)| label.clone())
        .ok_or_else(|| DriverError::parse(format!("'{reply}' is not an option of '{name}'")))
}

const SI_PREFIXES: [(&str, i32); 17] = [
    ("y", -24),
    ("z", -21),
    ("a", -18),
    ("f", -15),
    ("p", -12),
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
    ("Z", 21),
    ("Y", 24),
];

/// SI prefix and scale factor that bring `value` into `[1, 1000)`.
pub fn si_prefix(value: f64) -> (&'static str, f64) {
    if value == 0.0 || !value.is_finite() {
        return ("", 1.0);
    }
    let exp = ((value.abs().log10() / 3.0).floor() as i32 * 3).clamp(-24, 24);
    let prefix = SI_PREFIXES
        .iter()
        .find(|(_, e)| *e == exp)
        .map_or("", |(p, _)| p);
    (prefix, 10f64.powi(exp))
}

/// Six significant digits, trailing zeros dropped, exponent form for very
/// large or small magnitudes.
pub fn format_general(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    // The exponent is taken after rounding to six digits, so 999999.7
    // becomes 1e+06 rather than 1000000.
    let scientific = format!("{value:.5e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exp: i32 = exponent.parse().unwrap_or(0);
    if (-4..6).contains(&exp) {
        let decimals = usize::try_from(5 - exp).unwrap_or(0);
        trim_zeros(&format!("{value:.decimals$}"))
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_zeros(mantissa), exp.abs())
    }
}

fn trim_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDataType;
    use crate::transport::MockTransport;
    use tracing::Span;

    fn session(mock: &MockTransport) -> MessageSession {
        MessageSession::new(Box::new(mock.clone()), Span::none())
    }

    fn waveform() -> Quantity {
        Quantity::option("Waveform", &[("Sine", "SIN"), ("Square", "SQU"), ("Ramp", "RAMP")])
            .with_get_cmd("SOUR{ch}:FUNC?")
            .with_set_cmd("SOUR{ch}:FUNC {option}")
            .with_ch(1)
    }

    #[tokio::test]
    async fn test_template_clones_are_independent() {
        let template = Quantity::real("Frequency").with_unit("Hz").with_value(1e3);
        let mut a = template.clone();
        let b = template.clone();

        a.set_value(None, 2e6.into(), &CommandContext::new()).await.unwrap();
        assert_eq!(a.value, Some(QuantityValue::Real(2e6)));
        assert_eq!(b.value, Some(QuantityValue::Real(1e3)));
        assert_eq!(template.value, Some(QuantityValue::Real(1e3)));
    }

    #[tokio::test]
    async fn test_set_without_session_caches() {
        let mut q = Quantity::integer("Burst Cycles").with_set_cmd("BURS:NCYC {value}");
        q.set_value(None, 7.9.into(), &CommandContext::new()).await.unwrap();
        let value = q.get_value(None, &CommandContext::new()).await.unwrap();
        assert_eq!(value, Some(QuantityValue::Integer(7)));
    }

    #[tokio::test]
    async fn test_invalid_option_is_cached_but_not_written() {
        let mock = MockTransport::new("GPIB0::10::INSTR");
        let mut s = session(&mock);
        let mut q = waveform();

        q.set_value(Some(&mut s), "Triangle".into(), &CommandContext::new())
            .await
            .unwrap();
        assert_eq!(q.value, Some(QuantityValue::from("Triangle")));
        assert!(mock.written().is_empty());

        q.set_value(Some(&mut s), "Square".into(), &CommandContext::new().with("ch", 2))
            .await
            .unwrap();
        assert_eq!(mock.written(), vec!["SOUR2:FUNC SQU"]);
        assert_eq!(q.index(), Some(1));
        assert_eq!(q.cmd_option(), Some("SQU"));
    }

    #[tokio::test]
    async fn test_option_read_maps_code_to_label() {
        let mock = MockTransport::new("GPIB0::10::INSTR");
        mock.reply_to("SOUR1:FUNC?", "\"RAMP\"");
        let mut s = session(&mock);
        let mut q = waveform();

        let value = q.get_value(Some(&mut s), &CommandContext::new()).await.unwrap();
        assert_eq!(value, Some(QuantityValue::from("Ramp")));

        let other = MockTransport::new("GPIB0::11::INSTR");
        other.reply_to("SOUR1:FUNC?", "NOISE");
        let mut s = session(&other);
        let err = q.get_value(Some(&mut s), &CommandContext::new()).await.unwrap_err();
        assert!(matches!(err, DriverError::Parse(_)));
        assert_eq!(q.value, Some(QuantityValue::from("Ramp")));
    }

    #[tokio::test]
    async fn test_scalar_reads() {
        let mock = MockTransport::new("GPIB0::10::INSTR");
        mock.reply_to("OUTP1?", "1");
        mock.reply_to("FREQ?", "+1.000000E+06");
        mock.reply_to("DISP:TEXT?", "\"hello world\"\n");
        let mut s = session(&mock);
        let ctx = CommandContext::new();

        let mut output = Quantity::bool("Output").with_get_cmd("OUTP{ch}?").with_ch(1);
        assert_eq!(
            output.get_value(Some(&mut s), &ctx).await.unwrap(),
            Some(QuantityValue::Bool(true))
        );

        let mut freq = Quantity::real("Frequency").with_get_cmd("FREQ?");
        assert_eq!(
            freq.get_value(Some(&mut s), &ctx).await.unwrap(),
            Some(QuantityValue::Real(1e6))
        );

        let mut text = Quantity::string("Display Text").with_get_cmd("DISP:TEXT?");
        assert_eq!(
            text.get_value(Some(&mut s), &ctx).await.unwrap(),
            Some(QuantityValue::from("hello world"))
        );
    }

    #[tokio::test]
    async fn test_bool_written_as_integer() {
        let mock = MockTransport::new("GPIB0::10::INSTR");
        let mut s = session(&mock);
        let mut q = Quantity::bool("Output").with_set_cmd("OUTP {value}");
        q.set_value(Some(&mut s), true.into(), &CommandContext::new())
            .await
            .unwrap();
        assert_eq!(mock.written(), vec!["OUTP 1"]);
    }

    #[tokio::test]
    async fn test_vector_binary_read_and_write_unsupported() {
        let mock = MockTransport::new("GPIB0::10::INSTR");
        mock.reply_to("CURV?", b"#18\x00\x00\x80\x3f\x00\x00\x00\x40".to_vec());
        let mut s = session(&mock);
        let mut q = Quantity::vector("Trace")
            .with_get_cmd("CURV?")
            .with_set_cmd("DATA {value}");

        let ctx = CommandContext::new().binary(BinaryFormat::new(BlockDataType::F32, false));
        let value = q.get_value(Some(&mut s), &ctx).await.unwrap();
        assert_eq!(value, Some(QuantityValue::Vector(vec![1.0, 2.0])));

        let err = q
            .set_value(Some(&mut s), vec![0.0, 1.0].into(), &CommandContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Unsupported(_)));
        assert_eq!(q.value, Some(QuantityValue::Vector(vec![0.0, 1.0])));
    }

    #[tokio::test]
    async fn test_type_mismatch_leaves_cache() {
        let mut q = Quantity::real("Amplitude").with_value(0.5);
        let err = q
            .set_value(None, "loud".into(), &CommandContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidValue { .. }));
        assert_eq!(q.value, Some(QuantityValue::Real(0.5)));
    }

    #[test]
    fn test_missing_template_field() {
        let q = Quantity::real("Offset").with_set_cmd("SOUR{ch}:VOLT:OFFS {value}");
        let err = q
            .format_set_cmd(HashMap::new(), &CommandContext::new())
            .unwrap_err();
        assert!(matches!(err, DriverError::Template { .. }));
    }

    #[test]
    fn test_display_with_si_prefix() {
        let q = Quantity::real("Frequency").with_unit("Hz").with_value(1.5e6);
        assert_eq!(q.to_string(), "1.5 MHz");
        let q = Quantity::real("Amplitude").with_unit("V").with_value(2.5e-3);
        assert_eq!(q.to_string(), "2.5 mV");
        assert_eq!(Quantity::real("Phase").to_string(), "None");
    }

    #[test]
    fn test_format_general() {
        assert_eq!(format_general(1.0), "1");
        assert_eq!(format_general(0.000123), "0.000123");
        assert_eq!(format_general(1234567.0), "1.23457e+06");
        assert_eq!(format_general(-2.5e-7), "-2.5e-07");
    }

    #[test]
    fn test_format_general_rounding_crosses_decade() {
        assert_eq!(format_general(999999.7), "1e+06");
        assert_eq!(format_general(99999.97), "100000");
        assert_eq!(format_general(9.9999996e-5), "0.0001");
    }

    #[test]
    fn test_quantity_from_toml() {
        let q: Quantity = toml::from_str(
            r#"
            name = "Mode"
            type = "Option"
            options = [["Fast", "F"], ["Slow", "S"]]
            set_cmd = "MODE {option}"
            "#,
        )
        .unwrap();
        assert_eq!(q.kind.name(), "Option");
        assert_eq!(q.set_cmd, "MODE {option}");
    }
}
