use std::fmt;

use indexmap::IndexMap;

use crate::error::{CensusError, Result};

/// A value in GAP's printed syntax. Only the subset that shows up in the
/// census data files is understood; anything else parses as `Ident`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapValue {
    Int(i64),
    Bool(bool),
    Str(String),
    List(Vec<GapValue>),
    Record(IndexMap<String, GapValue>),
    /// Permutation in cycle notation, `()` is the empty vec.
    Cycles(Vec<Vec<i64>>),
    Ident(String),
}

impl GapValue {
    pub fn parse(text: &str) -> Result<GapValue> {
        let cleaned = strip_continuations(text);
        let mut parser = Parser::new(&cleaned);
        let value = parser.value()?;
        parser.skip_trivia();
        if let Some(c) = parser.peek() {
            if c != ';' {
                return Err(parser.error(format!("trailing input starting with {:?}", c)));
            }
        }
        Ok(value)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            GapValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GapValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GapValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[GapValue]> {
        match self {
            GapValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&IndexMap<String, GapValue>> {
        match self {
            GapValue::Record(r) => Some(r),
            _ => None,
        }
    }

    /// A list of non-negative integers, e.g. the images of a permutation.
    pub fn as_u64_list(&self) -> Option<Vec<u64>> {
        self.as_list()?
            .iter()
            .map(|v| v.as_int().and_then(|i| u64::try_from(i).ok()))
            .collect()
    }

    pub fn int_list<I: IntoIterator<Item = u64>>(items: I) -> GapValue {
        GapValue::List(items.into_iter().map(|i| GapValue::Int(i as i64)).collect())
    }
}

/// GAP breaks long output lines with a backslash followed by a newline.
pub fn strip_continuations(text: &str) -> String {
    text.replace("\\\r\n", "").replace("\\\n", "")
}

fn write_gap_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            _ => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

/// `name := value`, quoting names GAP would not read as identifiers.
pub(crate) fn write_field(f: &mut fmt::Formatter<'_>, name: &str, value: &GapValue) -> fmt::Result {
    if is_identifier(name) {
        write!(f, "{} := {}", name, value)
    } else {
        f.write_str("(")?;
        write_gap_string(f, name)?;
        write!(f, ") := {}", value)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for GapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapValue::Int(i) => write!(f, "{}", i),
            GapValue::Bool(b) => write!(f, "{}", b),
            GapValue::Str(s) => write_gap_string(f, s),
            GapValue::List(items) => {
                if items.is_empty() {
                    return f.write_str("[  ]");
                }
                f.write_str("[ ")?;
                for (ix, item) in items.iter().enumerate() {
                    if ix > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(" ]")
            }
            GapValue::Record(fields) => {
                f.write_str("rec( ")?;
                for (ix, (name, value)) in fields.iter().enumerate() {
                    if ix > 0 {
                        f.write_str(", ")?;
                    }
                    write_field(f, name, value)?;
                }
                f.write_str(" )")
            }
            GapValue::Cycles(cycles) => {
                if cycles.is_empty() {
                    return f.write_str("()");
                }
                for cycle in cycles {
                    f.write_str("(")?;
                    for (ix, point) in cycle.iter().enumerate() {
                        if ix > 0 {
                            f.write_str(",")?;
                        }
                        write!(f, "{}", point)?;
                    }
                    f.write_str(")")?;
                }
                Ok(())
            }
            GapValue::Ident(s) => f.write_str(s),
        }
    }
}

/// Reads every `name := value;` statement and a trailing `return value;` of
/// a GAP data file. The returned value is stored under the key `"return"`.
pub fn parse_assignments(text: &str) -> Result<IndexMap<String, GapValue>> {
    let cleaned = strip_continuations(text);
    let mut parser = Parser::new(&cleaned);
    let mut out = IndexMap::new();
    loop {
        parser.skip_trivia();
        if parser.peek().is_none() {
            break;
        }
        let name = parser.identifier()?;
        parser.skip_trivia();
        if name == "return" {
            let value = parser.value()?;
            out.insert(name, value);
        } else {
            parser.expect_str(":=")?;
            let value = parser.value()?;
            out.insert(name, value);
        }
        parser.skip_trivia();
        // `;;` is GAP's silent terminator
        while parser.peek() == Some(';') {
            parser.bump();
            parser.skip_trivia();
        }
    }
    Ok(out)
}

fn expand_range(low: i64, step: i64, high: i64) -> Vec<GapValue> {
    let mut out = Vec::new();
    let mut x = low;
    while (step > 0 && x <= high) || (step < 0 && x >= high) {
        out.push(GapValue::Int(x));
        x += step;
    }
    out
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> CensusError {
        CensusError::parse(self.pos, message)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        self.skip_trivia();
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            other => Err(self.error(format!("expected {:?}, found {:?}", want, other))),
        }
    }

    fn expect_str(&mut self, want: &str) -> Result<()> {
        self.skip_trivia();
        if self.rest().starts_with(want) {
            self.pos += want.len();
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", want)))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        self.skip_trivia();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' && self.pos > start {
                self.bump();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn integer(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos]
            .parse::<i64>()
            .map_err(|e| CensusError::parse(start, format!("bad integer: {}", e)))
    }

    fn string(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn value(&mut self) -> Result<GapValue> {
        self.skip_trivia();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('[') => self.list(),
            Some('(') => self.cycles(),
            Some('"') => Ok(GapValue::Str(self.string()?)),
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(GapValue::Int(self.integer()?)),
            Some(_) => {
                let word = self.identifier()?;
                match word.as_str() {
                    "true" => Ok(GapValue::Bool(true)),
                    "false" => Ok(GapValue::Bool(false)),
                    "rec" => self.record(),
                    _ => Ok(GapValue::Ident(word)),
                }
            }
        }
    }

    fn list(&mut self) -> Result<GapValue> {
        self.expect('[')?;
        let mut items = Vec::new();
        self.skip_trivia();
        if self.peek() == Some(']') {
            self.bump();
            return Ok(GapValue::List(items));
        }
        loop {
            let item = self.value()?;
            self.skip_trivia();
            if self.rest().starts_with("..") {
                // ranges print as [ a .. b ] or [ a, a + step .. b ]
                self.pos += 2;
                let bound = |v: &GapValue, p: &Self| {
                    v.as_int()
                        .ok_or_else(|| p.error("range bound is not an integer"))
                };
                let (low, step) = match items.as_slice() {
                    [] => (bound(&item, self)?, 1),
                    [first] => {
                        let first = bound(first, self)?;
                        (first, bound(&item, self)? - first)
                    }
                    _ => return Err(self.error("range with more than two leading elements")),
                };
                if step == 0 {
                    return Err(self.error("range step is zero"));
                }
                self.skip_trivia();
                let high = self.integer()?;
                items = expand_range(low, step, high);
                self.expect(']')?;
                return Ok(GapValue::List(items));
            }
            items.push(item);
            self.skip_trivia();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(GapValue::List(items)),
                other => {
                    return Err(self.error(format!("expected ',' or ']' in list, found {:?}", other)))
                }
            }
        }
    }

    fn record(&mut self) -> Result<GapValue> {
        self.expect('(')?;
        let mut fields = IndexMap::new();
        self.skip_trivia();
        if self.peek() == Some(')') {
            self.bump();
            return Ok(GapValue::Record(fields));
        }
        loop {
            self.skip_trivia();
            let name = if self.peek() == Some('(') {
                self.bump();
                self.skip_trivia();
                let name = self.string()?;
                self.expect(')')?;
                name
            } else {
                self.identifier()?
            };
            self.expect_str(":=")?;
            let value = self.value()?;
            fields.insert(name, value);
            self.skip_trivia();
            match self.bump() {
                Some(',') => continue,
                Some(')') => return Ok(GapValue::Record(fields)),
                other => {
                    return Err(self.error(format!("expected ',' or ')' in record, found {:?}", other)))
                }
            }
        }
    }

    fn cycles(&mut self) -> Result<GapValue> {
        let mut cycles = Vec::new();
        self.skip_trivia();
        while self.peek() == Some('(') {
            self.bump();
            let mut cycle = Vec::new();
            self.skip_trivia();
            if self.peek() != Some(')') {
                loop {
                    self.skip_trivia();
                    cycle.push(self.integer()?);
                    self.skip_trivia();
                    match self.bump() {
                        Some(',') => continue,
                        Some(')') => break,
                        other => {
                            return Err(
                                self.error(format!("expected ',' or ')' in cycle, found {:?}", other))
                            )
                        }
                    }
                }
            } else {
                self.bump();
            }
            if !cycle.is_empty() {
                cycles.push(cycle);
            }
            // cycles are written without separators: (1,2)(3,4)
            if self.peek() != Some('(') {
                break;
            }
        }
        Ok(GapValue::Cycles(cycles))
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_assignments, GapValue};

    #[test]
    fn nested_lists_round_trip_through_display() {
        let v = GapValue::parse("[2592,162,  42, 3,[2,2,2,2]]").unwrap();
        assert_eq!(v.to_string(), "[ 2592, 162, 42, 3, [ 2, 2, 2, 2 ] ]");
        let empty = GapValue::parse("[ ]").unwrap();
        assert_eq!(empty.to_string(), "[  ]");
    }

    #[test]
    fn ranges_are_expanded() {
        let v = GapValue::parse("[ 1 .. 5 ]").unwrap();
        assert_eq!(v.as_u64_list().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stepped_ranges_use_the_first_difference() {
        let v = GapValue::parse("[ 1, 3 .. 9 ]").unwrap();
        assert_eq!(v.as_u64_list().unwrap(), vec![1, 3, 5, 7, 9]);
        let down = GapValue::parse("[ 10, 7 .. 1 ]").unwrap();
        assert_eq!(down.as_u64_list().unwrap(), vec![10, 7, 4, 1]);
        let empty = GapValue::parse("[ 5 .. 1 ]").unwrap();
        assert_eq!(empty.as_list().unwrap().len(), 0);
        assert!(GapValue::parse("[ 2, 2 .. 8 ]").is_err());
    }

    #[test]
    fn line_continuations_and_comments() {
        let text = "[ 1, 2, 3\\\n4, # four-ish\n 5 ]";
        let v = GapValue::parse(text).unwrap();
        assert_eq!(v.as_u64_list().unwrap(), vec![1, 2, 34, 5]);
    }

    #[test]
    fn records_keep_field_order() {
        let v = GapValue::parse(
            "rec( index := 3, gens := [ [ 2, 1, 3 ] ], source := \"leaf \\\"a\\\"\", isDirectProduct := false )",
        )
        .unwrap();
        let r = v.as_record().unwrap();
        let names: Vec<&str> = r.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["index", "gens", "source", "isDirectProduct"]);
        assert_eq!(r["source"].as_str(), Some("leaf \"a\""));
        assert_eq!(r["isDirectProduct"].as_bool(), Some(false));
        assert_eq!(
            v.to_string(),
            "rec( index := 3, gens := [ [ 2, 1, 3 ] ], source := \"leaf \\\"a\\\"\", isDirectProduct := false )"
        );
    }

    #[test]
    fn quoted_field_names() {
        let v = GapValue::parse("rec( (\"12\") := 5, (\"40\") := 5 )").unwrap();
        assert_eq!(v.as_record().unwrap()["12"].as_int(), Some(5));
        assert_eq!(v.to_string(), "rec( (\"12\") := 5, (\"40\") := 5 )");
    }

    #[test]
    fn cycle_notation() {
        let v = GapValue::parse("(1,2)(3,4,5)").unwrap();
        assert_eq!(v, GapValue::Cycles(vec![vec![1, 2], vec![3, 4, 5]]));
        assert_eq!(GapValue::parse("()").unwrap().to_string(), "()");
    }

    #[test]
    fn assignments_and_return() {
        let text = "# header\nRESULT_REPS_DP := [ 4, 9 ];\nx := fail;;\nreturn [ [ [ 1, 2 ] ] ];\n";
        let parsed = parse_assignments(text).unwrap();
        assert_eq!(parsed["RESULT_REPS_DP"].as_u64_list().unwrap(), vec![4, 9]);
        assert_eq!(parsed["x"], GapValue::Ident(String::from("fail")));
        assert_eq!(parsed["return"].as_list().unwrap().len(), 1);
    }

    #[test]
    fn unterminated_list_is_an_error() {
        assert!(GapValue::parse("[ 1, 2").is_err());
    }
}
