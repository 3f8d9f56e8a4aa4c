//! The row predicate language accepted by queries and removals.
//!
//! Grammar (whitespace-insensitive, `&` binds tighter than `|`):
//!
//! ```text
//! expr    := and_expr ( "|" and_expr )*
//! and_expr:= atom ( "&" atom )*
//! atom    := "(" expr ")" | column op literal
//! op      := "=" | "==" | "!=" | ">" | ">=" | "<" | "<="
//! literal := 'quoted' | "quoted" | 2020-06-01 | 2020-06-01T09:30:00 | 42 | 4.2
//! ```
//!
//! Quoted literals are always strings; bare literals are read as a date, a
//! timestamp, an integer or a float, in that order. Rendering a parsed
//! predicate with `Display` yields text that parses back to the same tree.
//!
//! Besides evaluation against a [`Row`], predicates expose conservative
//! summaries ([`Predicate::time_bounds`], [`Predicate::code_set`]) that the
//! store uses to skip segments which cannot contain a match.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    iter::Peekable,
    str::{CharIndices, FromStr},
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use snafu::prelude::*;

use crate::helpers::calendar;
use crate::row::{Row, Value, parse_timestamp};

/// Errors raised while building predicates.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum PredicateError {
    /// The predicate text is malformed.
    #[snafu(display("Invalid predicate at offset {position}: {message}"))]
    Parse {
        /// Byte offset of the offending token.
        position: usize,
        /// What went wrong.
        message: String,
    },

    /// An entity code does not match the dataset's code format.
    #[snafu(display("Invalid entity code {code:?}: expected pattern {pattern}"))]
    InvalidCode {
        /// The rejected code.
        code: String,
        /// The pattern it failed.
        pattern: String,
    },
}

/// Comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=` or `==`.
    Eq,
    /// `!=`.
    Ne,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
}

impl CompareOp {
    /// Canonical spelling.
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
        }
    }
}

/// A boolean expression over row columns.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// `column op literal`.
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CompareOp,
        /// Literal operand.
        value: Value,
    },
    /// Both sides hold.
    And(Box<Predicate>, Box<Predicate>),
    /// Either side holds.
    Or(Box<Predicate>, Box<Predicate>),
}

/// Inclusive time range a predicate can possibly match on one column.
///
/// `None` on either side means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeBounds {
    /// No match lies before this instant.
    pub lower: Option<NaiveDateTime>,
    /// No match lies after this instant.
    pub upper: Option<NaiveDateTime>,
}

impl TimeBounds {
    /// Whether `[min, max]` can intersect the bounds.
    pub fn overlaps(&self, min: NaiveDateTime, max: NaiveDateTime) -> bool {
        self.lower.is_none_or(|lo| max >= lo) && self.upper.is_none_or(|hi| min <= hi)
    }
}

impl Predicate {
    /// `column op value`.
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Conjunction.
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// Disjunction.
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Parse predicate text.
    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let mut parser = Parser::new(input)?;
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some((pos, tok)) => ParseSnafu {
                position: *pos,
                message: format!("unexpected trailing {tok:?}"),
            }
            .fail(),
        }
    }

    /// Evaluate against a row. Comparisons involving a missing value or
    /// incomparable kinds are false.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Compare { column, op, value } => {
                let cell = row.value(column);
                compare_cell(cell, value).is_some_and(|ord| op.holds(ord))
            }
            Predicate::And(a, b) => a.matches(row) && b.matches(row),
            Predicate::Or(a, b) => a.matches(row) || b.matches(row),
        }
    }

    /// Columns referenced anywhere in the predicate.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Compare { column, .. } => {
                out.insert(column.as_str());
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
        }
    }

    /// Conservative time range on `column` outside which nothing matches.
    pub fn time_bounds(&self, column: &str) -> TimeBounds {
        match self {
            Predicate::Compare {
                column: c,
                op,
                value,
            } if c == column => {
                let Some(at) = literal_datetime(value) else {
                    return TimeBounds::default();
                };
                match op {
                    CompareOp::Eq => TimeBounds {
                        lower: Some(at),
                        upper: Some(at),
                    },
                    CompareOp::Gt | CompareOp::Ge => TimeBounds {
                        lower: Some(at),
                        upper: None,
                    },
                    CompareOp::Lt | CompareOp::Le => TimeBounds {
                        lower: None,
                        upper: Some(at),
                    },
                    CompareOp::Ne => TimeBounds::default(),
                }
            }
            Predicate::Compare { .. } => TimeBounds::default(),
            Predicate::And(a, b) => {
                let (a, b) = (a.time_bounds(column), b.time_bounds(column));
                TimeBounds {
                    lower: a.lower.max(b.lower),
                    upper: match (a.upper, b.upper) {
                        (Some(x), Some(y)) => Some(x.min(y)),
                        (x, y) => x.or(y),
                    },
                }
            }
            Predicate::Or(a, b) => {
                let (a, b) = (a.time_bounds(column), b.time_bounds(column));
                TimeBounds {
                    lower: a.lower.zip(b.lower).map(|(x, y)| x.min(y)),
                    upper: a.upper.zip(b.upper).map(|(x, y)| x.max(y)),
                }
            }
        }
    }

    /// Set of `column` values outside which nothing matches, when the
    /// predicate pins the column to a finite set of strings.
    pub fn code_set(&self, column: &str) -> Option<BTreeSet<String>> {
        match self {
            Predicate::Compare {
                column: c,
                op: CompareOp::Eq,
                value: Value::Str(s),
            } if c == column => Some(BTreeSet::from([s.clone()])),
            Predicate::Compare { .. } => None,
            Predicate::And(a, b) => match (a.code_set(column), b.code_set(column)) {
                (Some(x), Some(y)) => Some(x.intersection(&y).cloned().collect()),
                (x, y) => x.or(y),
            },
            Predicate::Or(a, b) => {
                let mut x = a.code_set(column)?;
                x.extend(b.code_set(column)?);
                Some(x)
            }
        }
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Predicate::parse(s)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => {
                write!(f, "{column} {} ", op.symbol())?;
                match value {
                    Value::Str(s) if s.contains('\'') => write!(f, "\"{s}\""),
                    Value::Str(s) => write!(f, "'{s}'"),
                    other => write!(f, "{other}"),
                }
            }
            Predicate::And(a, b) => {
                for (i, side) in [a, b].into_iter().enumerate() {
                    if i > 0 {
                        write!(f, " & ")?;
                    }
                    match side.as_ref() {
                        Predicate::Or(..) => write!(f, "({side})")?,
                        _ => write!(f, "{side}")?,
                    }
                }
                Ok(())
            }
            Predicate::Or(a, b) => write!(f, "{a} | {b}"),
        }
    }
}

fn literal_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Str(s) => parse_timestamp(s),
        other => other.as_datetime(),
    }
}

fn compare_cell(cell: &Value, literal: &Value) -> Option<Ordering> {
    match (cell, literal) {
        (Value::Date(_) | Value::Timestamp(_), Value::Str(_)) => {
            let at = literal_datetime(literal)?;
            cell.as_datetime().map(|c| c.cmp(&at))
        }
        _ => cell.compare(literal),
    }
}

/// Time clause over `column` for an optional `[start, end]` day range.
///
/// A range that starts and ends on the same day becomes
/// `column >= day & column < day + 1` so that timestamped rows on that day
/// still match.
pub fn time_clause(
    column: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Option<Predicate> {
    match (start, end) {
        (Some(s), Some(e)) if s == e => Some(
            Predicate::compare(column, CompareOp::Ge, s)
                .and(Predicate::compare(column, CompareOp::Lt, calendar::succ(s))),
        ),
        (Some(s), Some(e)) => Some(
            Predicate::compare(column, CompareOp::Ge, s)
                .and(Predicate::compare(column, CompareOp::Le, e)),
        ),
        (Some(s), None) => Some(Predicate::compare(column, CompareOp::Ge, s)),
        (None, Some(e)) => Some(Predicate::compare(column, CompareOp::Le, e)),
        (None, None) => None,
    }
}

/// Membership of `column` in `values`, expanded to an OR-chain of equalities.
pub fn membership<I, V>(column: &str, values: I) -> Option<Predicate>
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    values
        .into_iter()
        .map(|v| Predicate::compare(column, CompareOp::Eq, v))
        .reduce(Predicate::or)
}

/// Code membership clause; every code must match `pattern`.
pub fn codes_clause(
    column: &str,
    codes: &[String],
    pattern: &Regex,
) -> Result<Option<Predicate>, PredicateError> {
    for code in codes {
        ensure!(
            pattern.is_match(code),
            InvalidCodeSnafu {
                code: code.clone(),
                pattern: pattern.as_str(),
            }
        );
    }
    Ok(membership(column, codes.iter().map(String::as_str)))
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Op(CompareOp),
    Ident(String),
    Literal(Value),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, PredicateError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|(p, _)| p + 1).unwrap_or(0)
    }

    fn expr(&mut self) -> Result<Predicate, PredicateError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.pos += 1;
            lhs = lhs.or(self.and_expr()?);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Predicate, PredicateError> {
        let mut lhs = self.atom()?;
        while matches!(self.peek(), Some((_, Token::And))) {
            self.pos += 1;
            lhs = lhs.and(self.atom()?);
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Predicate, PredicateError> {
        let end = self.end_offset();
        match self.next() {
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, tok)) => ParseSnafu {
                        position: pos,
                        message: format!("expected ')', found {tok:?}"),
                    }
                    .fail(),
                    None => ParseSnafu {
                        position: end,
                        message: "unclosed '('",
                    }
                    .fail(),
                }
            }
            Some((_, Token::Ident(column))) => {
                let op = match self.next() {
                    Some((_, Token::Op(op))) => op,
                    Some((pos, tok)) => {
                        return ParseSnafu {
                            position: pos,
                            message: format!("expected comparison operator, found {tok:?}"),
                        }
                        .fail();
                    }
                    None => {
                        return ParseSnafu {
                            position: end,
                            message: "expected comparison operator",
                        }
                        .fail();
                    }
                };
                match self.next() {
                    Some((_, Token::Literal(value))) => {
                        Ok(Predicate::Compare { column, op, value })
                    }
                    Some((pos, tok)) => ParseSnafu {
                        position: pos,
                        message: format!("expected literal, found {tok:?}"),
                    }
                    .fail(),
                    None => ParseSnafu {
                        position: end,
                        message: "expected literal",
                    }
                    .fail(),
                }
            }
            Some((pos, tok)) => ParseSnafu {
                position: pos,
                message: format!("expected column or '(', found {tok:?}"),
            }
            .fail(),
            None => ParseSnafu {
                position: end,
                message: "empty expression",
            }
            .fail(),
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || "()&|=!<>'\"".contains(c)
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, PredicateError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices<'_>> = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = match c {
            '(' => {
                chars.next();
                Token::LParen
            }
            ')' => {
                chars.next();
                Token::RParen
            }
            '&' => {
                chars.next();
                Token::And
            }
            '|' => {
                chars.next();
                Token::Or
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let followed_by_eq = matches!(chars.peek(), Some((_, '=')));
                if followed_by_eq {
                    chars.next();
                }
                let op = match (c, followed_by_eq) {
                    ('=', _) => CompareOp::Eq,
                    ('!', true) => CompareOp::Ne,
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    ('>', true) => CompareOp::Ge,
                    _ => {
                        return ParseSnafu {
                            position: pos,
                            message: "'!' must be followed by '='",
                        }
                        .fail();
                    }
                };
                Token::Op(op)
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, ch) in chars.by_ref() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    text.push(ch);
                }
                ensure!(
                    closed,
                    ParseSnafu {
                        position: pos,
                        message: "unterminated string literal",
                    }
                );
                Token::Literal(Value::Str(text))
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if is_delimiter(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' {
                    Token::Literal(parse_bare_literal(&word).context(ParseSnafu {
                        position: pos,
                        message: format!("cannot read literal {word:?}"),
                    })?)
                } else {
                    Token::Ident(word)
                }
            }
        };
        tokens.push((pos, token));
    }

    Ok(tokens)
}

fn parse_bare_literal(word: &str) -> Option<Value> {
    if let Ok(d) = NaiveDate::parse_from_str(word, "%Y-%m-%d") {
        return Some(Value::Date(d));
    }
    if word.contains(['T', ':']) {
        return parse_timestamp(word).map(Value::Timestamp);
    }
    if let Ok(i) = word.parse::<i64>() {
        return Some(Value::Int(i));
    }
    word.parse::<f64>().ok().map(Value::Float)
}

/// Midnight of `day`, the instant a date literal compares as.
pub fn day_start(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DEFAULT_CODE_PATTERN, test_util::date};

    fn quote(day: NaiveDate, code: &str, close: f64) -> Row {
        Row::new()
            .with("date", day)
            .with("code", code)
            .with("close", close)
    }

    #[test]
    fn parses_precedence_and_grouping() {
        let p =
            Predicate::parse("code == '000001' | code == '000002' & close > 10").expect("parse");
        assert_eq!(
            p,
            Predicate::compare("code", CompareOp::Eq, "000001").or(
                Predicate::compare("code", CompareOp::Eq, "000002")
                    .and(Predicate::compare("close", CompareOp::Gt, 10i64))
            )
        );

        let grouped =
            Predicate::parse("(code = '000001' | code = '000002') & close >= 10.5").expect("parse");
        assert!(matches!(grouped, Predicate::And(..)));
    }

    #[test]
    fn bare_literals_are_typed() {
        let text = "date >= 2020-06-01 & ts < 2020-06-01T09:30:00 & n != -3 & x <= 0.5";
        let p = Predicate::parse(text).expect("parse");
        let rendered = p.to_string();
        assert_eq!(
            rendered,
            "date >= 2020-06-01 & ts < 2020-06-01T09:30:00 & n != -3 & x <= 0.5"
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        for text in [
            "code == '000001'",
            "(a == 1 | b == 2) & c < 3",
            "a == 1 | b == 2 & c < 3",
            "name == \"it's\"",
            "date >= 2020-01-01 & date < 2020-01-02",
        ] {
            let parsed = Predicate::parse(text).expect("parse");
            let reparsed = Predicate::parse(&parsed.to_string()).expect("reparse");
            assert_eq!(parsed, reparsed, "{text}");
        }
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = Predicate::parse("code == ").unwrap_err();
        assert!(matches!(err, PredicateError::Parse { .. }));

        let err = Predicate::parse("code == '0001").unwrap_err();
        assert_eq!(
            err,
            PredicateError::Parse {
                position: 8,
                message: "unterminated string literal".to_string()
            }
        );

        assert!(Predicate::parse("(a == 1").is_err());
        assert!(Predicate::parse("a == 1 b").is_err());
        assert!(Predicate::parse("a ! 1").is_err());
        assert!(Predicate::parse("").is_err());
    }

    #[test]
    fn evaluates_against_rows() {
        let row = quote(date(2020, 6, 1), "000001", 12.0);
        let hit = Predicate::parse("date >= 2020-06-01 & (code == '000001' | code == '000002')")
            .expect("parse");
        let miss = Predicate::parse("close > 12").expect("parse");
        let quoted_date = Predicate::parse("date == '2020-06-01'").expect("parse");
        let missing_column = Predicate::parse("volume > 0").expect("parse");

        assert!(hit.matches(&row));
        assert!(!miss.matches(&row));
        assert!(quoted_date.matches(&row));
        assert!(!missing_column.matches(&row));
    }

    #[test]
    fn same_day_time_clause_spans_the_whole_day() {
        let day = date(2020, 6, 1);
        let clause = time_clause("date", Some(day), Some(day)).expect("clause");
        assert_eq!(clause.to_string(), "date >= 2020-06-01 & date < 2020-06-02");

        let intraday = Row::new().with("date", day.and_hms_opt(14, 0, 0).expect("time"));
        assert!(clause.matches(&intraday));

        assert_eq!(
            time_clause("date", Some(day), Some(date(2020, 6, 5)))
                .expect("clause")
                .to_string(),
            "date >= 2020-06-01 & date <= 2020-06-05"
        );
        assert!(time_clause("date", None, None).is_none());
    }

    #[test]
    fn codes_clause_validates_and_expands() {
        let pattern = Regex::new(DEFAULT_CODE_PATTERN).expect("regex");
        let clause = codes_clause("code", &["000001".into(), "600000".into()], &pattern)
            .expect("valid")
            .expect("non-empty");
        assert_eq!(clause.to_string(), "code == '000001' | code == '600000'");

        assert!(codes_clause("code", &[], &pattern).expect("valid").is_none());

        let err = codes_clause("code", &["ABC".into()], &pattern).unwrap_err();
        assert!(matches!(err, PredicateError::InvalidCode { .. }));
    }

    #[test]
    fn time_bounds_are_conservative() {
        let p = Predicate::parse("date >= 2020-01-01 & date <= 2020-03-31").expect("parse");
        let b = p.time_bounds("date");
        assert_eq!(b.lower, Some(day_start(date(2020, 1, 1))));
        assert_eq!(b.upper, Some(day_start(date(2020, 3, 31))));
        assert!(b.overlaps(day_start(date(2019, 12, 1)), day_start(date(2020, 1, 1))));
        assert!(!b.overlaps(day_start(date(2020, 4, 1)), day_start(date(2020, 5, 1))));

        let either = Predicate::parse("date >= 2020-01-01 | code == '000001'").expect("parse");
        assert_eq!(either.time_bounds("date"), TimeBounds::default());
    }

    #[test]
    fn code_set_tracks_pinned_codes() {
        let p = Predicate::parse("(code == '000001' | code == '000002') & date >= 2020-01-01")
            .expect("parse");
        assert_eq!(
            p.code_set("code"),
            Some(BTreeSet::from(["000001".to_string(), "000002".to_string()]))
        );
        let open = Predicate::parse("code == '000001' | close > 1").expect("parse");
        assert_eq!(open.code_set("code"), None);
    }
}
