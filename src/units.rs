//! Physical units and linear conversions between them.
//!
//! Every unit is stored relative to SI base units as
//! `si_value = (value + offset) * factor` together with the integer exponents
//! of the eight base dimensions `[kg, m, s, A, K, mol, cd, rad]`. Two units are
//! convertible when their exponents agree; the conversion is then affine:
//! `target = scale * source + offset`.
//!
//! Expressions combine registered names with `*`, `/`, `**` (or `^`) and
//! parentheses, e.g. `kg*m/s**2` or `1/(h*K)`. Units carrying an offset
//! (`degC`, `degF`) cannot appear inside a compound expression.
//!
//! # Examples
//!
//! ```
//! use plexus::units::UnitRegistry;
//!
//! let units = UnitRegistry::new();
//! let (scale, offset) = units.conversion("km/h", "m/s").unwrap();
//! assert!((scale - 1.0 / 3.6).abs() < 1e-12);
//! assert_eq!(offset, 0.0);
//!
//! assert_eq!(units.conversion("degC", "K").unwrap(), (1.0, 273.15));
//! assert!(units.conversion("m", "s").is_err());
//! ```

use std::collections::HashMap;
use std::f64::consts::PI;

/// Errors raised while interpreting unit strings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    /// The name is not registered
    #[error("Unknown unit '{0}'")]
    Unknown(String),
    /// The expression could not be parsed
    #[error("Invalid unit expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },
    /// The units have different dimensions
    #[error("Units '{source_units}' and '{target_units}' are incompatible")]
    Incompatible { source_units: String, target_units: String },
}

/// Dimensional exponents, ordered `[kg, m, s, A, K, mol, cd, rad]`.
pub type Powers = [i32; 8];

const KG: usize = 0;
const M: usize = 1;
const S: usize = 2;
const A: usize = 3;
const K: usize = 4;
const MOL: usize = 5;
const CD: usize = 6;
const RAD: usize = 7;

/// A unit expressed in SI base units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalUnit {
    /// Multiplier to SI
    pub factor: f64,
    /// Added before scaling
    pub offset: f64,
    pub powers: Powers,
}

impl PhysicalUnit {
    /// The dimensionless unit with factor `factor`.
    pub fn scalar(factor: f64) -> Self {
        PhysicalUnit { factor, offset: 0.0, powers: [0; 8] }
    }

    fn base(dim: usize) -> Self {
        let mut powers = [0; 8];
        powers[dim] = 1;
        PhysicalUnit { factor: 1.0, offset: 0.0, powers }
    }

    fn from_powers(factor: f64, dims: &[(usize, i32)]) -> Self {
        let mut powers = [0; 8];
        for &(dim, p) in dims {
            powers[dim] = p;
        }
        PhysicalUnit { factor, offset: 0.0, powers }
    }

    /// Whether both units measure the same dimension.
    pub fn is_compatible(&self, other: &PhysicalUnit) -> bool {
        self.powers == other.powers
    }

    fn mul(self, other: PhysicalUnit) -> Self {
        let mut powers = self.powers;
        for (p, q) in powers.iter_mut().zip(other.powers) {
            *p += q;
        }
        PhysicalUnit { factor: self.factor * other.factor, offset: 0.0, powers }
    }

    fn powi(self, n: i32) -> Self {
        PhysicalUnit {
            factor: self.factor.powi(n),
            offset: 0.0,
            powers: self.powers.map(|p| p * n),
        }
    }

    /// `(scale, offset)` such that `target = scale * source + offset`.
    pub fn conversion_to(&self, target: &PhysicalUnit) -> Option<(f64, f64)> {
        if !self.is_compatible(target) {
            return None;
        }
        let scale = self.factor / target.factor;
        let offset = self.offset * self.factor / target.factor - target.offset;
        Some((scale, offset))
    }
}

/// Table of named units.
///
/// A fresh registry knows the SI base units, common derived and imperial
/// units, and the offset temperature scales.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    units: HashMap<String, PhysicalUnit>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    /// Creates a registry with the built-in units.
    pub fn new() -> Self {
        let mut units = HashMap::new();
        let mut add = |name: &str, unit: PhysicalUnit| {
            units.insert(name.to_string(), unit);
        };

        let length = PhysicalUnit::base(M);
        let mass = PhysicalUnit::base(KG);
        let time = PhysicalUnit::base(S);
        let force = PhysicalUnit::from_powers(1.0, &[(KG, 1), (M, 1), (S, -2)]);
        let pressure = PhysicalUnit::from_powers(1.0, &[(KG, 1), (M, -1), (S, -2)]);
        let energy = PhysicalUnit::from_powers(1.0, &[(KG, 1), (M, 2), (S, -2)]);
        let power = PhysicalUnit::from_powers(1.0, &[(KG, 1), (M, 2), (S, -3)]);
        let scaled = |unit: PhysicalUnit, factor: f64| PhysicalUnit { factor, ..unit };

        add("m", length);
        add("cm", scaled(length, 1e-2));
        add("mm", scaled(length, 1e-3));
        add("km", scaled(length, 1e3));
        add("inch", scaled(length, 0.0254));
        add("ft", scaled(length, 0.3048));
        add("mi", scaled(length, 1609.344));

        add("s", time);
        add("min", scaled(time, 60.0));
        add("h", scaled(time, 3600.0));
        add("Hz", PhysicalUnit::from_powers(1.0, &[(S, -1)]));

        add("kg", mass);
        add("g", scaled(mass, 1e-3));
        add("lb", scaled(mass, 0.45359237));

        add("N", force);
        add("kN", scaled(force, 1e3));
        add("lbf", scaled(force, 4.4482216152605));

        add("Pa", pressure);
        add("kPa", scaled(pressure, 1e3));
        add("MPa", scaled(pressure, 1e6));
        add("bar", scaled(pressure, 1e5));
        add("psi", scaled(pressure, 6894.757293168361));
        add("atm", scaled(pressure, 101325.0));

        add("J", energy);
        add("kJ", scaled(energy, 1e3));
        add("W", power);
        add("kW", scaled(power, 1e3));

        add("L", PhysicalUnit::from_powers(1e-3, &[(M, 3)]));

        let temperature = PhysicalUnit::base(K);
        add("K", temperature);
        add("degR", scaled(temperature, 5.0 / 9.0));
        add("degC", PhysicalUnit { offset: 273.15, ..temperature });
        add("degF", PhysicalUnit { factor: 5.0 / 9.0, offset: 459.67, ..temperature });

        add("rad", PhysicalUnit::base(RAD));
        add("deg", PhysicalUnit { factor: PI / 180.0, ..PhysicalUnit::base(RAD) });
        add("A", PhysicalUnit::base(A));
        add("mol", PhysicalUnit::base(MOL));
        add("cd", PhysicalUnit::base(CD));

        UnitRegistry { units }
    }

    /// Registers `name` as `factor` times `base` with an optional offset.
    ///
    /// With `si = (value + offset) * factor * base_factor`, a unit for degrees
    /// Celsius would be `define("degC", "K", 1.0, 273.15)`.
    pub fn define(&mut self, name: &str, base: &str, factor: f64, offset: f64) -> Result<(), UnitError> {
        let base = self.parse(base)?;
        if base.offset != 0.0 {
            return Err(UnitError::Syntax {
                expr: name.to_string(),
                reason: "cannot define a unit on top of an offset unit".to_string(),
            });
        }
        let unit = PhysicalUnit { factor: base.factor * factor, offset, powers: base.powers };
        self.units.insert(name.to_string(), unit);
        Ok(())
    }

    /// Whether `name` is registered (not parsed).
    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Parses a unit expression.
    pub fn parse(&self, expr: &str) -> Result<PhysicalUnit, UnitError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser { registry: self, expr, tokens: &tokens, pos: 0 };
        let unit = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(unit)
    }

    /// Returns `(scale, offset)` converting a value in `source` to `target`.
    ///
    /// Identical strings short-circuit to the identity.
    pub fn conversion(&self, source: &str, target: &str) -> Result<(f64, f64), UnitError> {
        if source == target {
            return Ok((1.0, 0.0));
        }
        let src = self.parse(source)?;
        let tgt = self.parse(target)?;
        src.conversion_to(&tgt).ok_or_else(|| UnitError::Incompatible {
            source_units: source.to_string(),
            target_units: target.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Number(f64),
    Mul,
    Div,
    Pow,
    Open,
    Close,
    Minus,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, UnitError> {
    let syntax = |reason: String| UnitError::Syntax { expr: expr.to_string(), reason };
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' => i += 1,
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Mul);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Pow);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Div);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| syntax(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => return Err(syntax(format!("unexpected character '{other}'"))),
        }
    }

    if tokens.is_empty() {
        return Err(syntax("empty expression".to_string()));
    }
    Ok(tokens)
}

/// Recursive descent over `expr := term (('*' | '/') term)*`,
/// `term := atom ('**' int)?`, `atom := name | number | '(' expr ')'`.
struct Parser<'a> {
    registry: &'a UnitRegistry,
    expr: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> UnitError {
        UnitError::Syntax { expr: self.expr.to_string(), reason: reason.to_string() }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tokens = self.tokens;
        let token = tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn no_offset(&self, unit: &PhysicalUnit) -> Result<(), UnitError> {
        if unit.offset != 0.0 {
            return Err(self.error("units with an offset cannot be combined"));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<PhysicalUnit, UnitError> {
        let mut unit = self.term()?;
        loop {
            let divide = match self.peek() {
                Some(Token::Mul) => false,
                Some(Token::Div) => true,
                _ => return Ok(unit),
            };
            self.pos += 1;
            let rhs = self.term()?;
            self.no_offset(&unit)?;
            self.no_offset(&rhs)?;
            unit = if divide { unit.mul(rhs.powi(-1)) } else { unit.mul(rhs) };
        }
    }

    fn term(&mut self) -> Result<PhysicalUnit, UnitError> {
        let unit = self.atom()?;
        if self.peek() != Some(&Token::Pow) {
            return Ok(unit);
        }
        self.pos += 1;
        let negative = if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            true
        } else {
            false
        };
        let exponent = match self.next() {
            Some(Token::Number(n)) if n.fract() == 0.0 => *n as i32,
            _ => return Err(self.error("exponent must be an integer")),
        };
        let exponent = if negative { -exponent } else { exponent };
        if exponent == 1 {
            return Ok(unit);
        }
        self.no_offset(&unit)?;
        Ok(unit.powi(exponent))
    }

    fn atom(&mut self) -> Result<PhysicalUnit, UnitError> {
        match self.next().cloned() {
            Some(Token::Name(name)) => {
                self.registry.units.get(&name).copied().ok_or(UnitError::Unknown(name))
            }
            Some(Token::Number(n)) => Ok(PhysicalUnit::scalar(n)),
            Some(Token::Open) => {
                let unit = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(unit),
                    _ => Err(self.error("missing ')'")),
                }
            }
            _ => Err(self.error("expected a unit name")),
        }
    }
}
