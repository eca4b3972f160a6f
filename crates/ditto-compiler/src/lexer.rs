//! lexer.rs — Analyse lexicale du langage Ditto.
//!
//! Flux paresseux à deux tokens visibles (`pre`, `cur`), lignes 1-based.
//! Commentaires `// …` et `/* … */` sans imbrication. Chaînes avec échappes
//! `\0 \a \b \f \n \r \t \u \" \\ \%` et interpolation `%( … )` : le
//! fragment qui précède une expression intégrée sort comme token
//! [`TokenKind::Interpolation`], le lexeur reprend la chaîne à la parenthèse
//! fermante d'équilibre. L'interpolation ne s'imbrique pas et tolère au
//! plus [`MAX_INTERPOLATION_PARENS`] parenthèses en attente.

use ditto_core::utf8;

use crate::error::CompileError;
use crate::token::{keyword_kind, Literal, Token, TokenKind};

/// Parenthèses simples encore ouvertes tolérées dans une expression
/// intégrée `%( … )` avant la parenthèse d'équilibre.
const MAX_INTERPOLATION_PARENS: u32 = 8;

pub struct Lexer {
    file: Option<String>,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    /// Token consommé en dernier (celui que traitent les handlers Pratt).
    pub pre: Token,
    /// Token sous le curseur.
    pub cur: Token,
    /// `Some(n)` pendant la lecture d'une expression intégrée : nombre de
    /// parenthèses ouvertes en attente avant la reprise de la chaîne.
    interp_parens: Option<u32>,
}

impl Lexer {
    pub fn new(file: Option<&str>, src: &str) -> Result<Lexer, CompileError> {
        let mut lexer = Lexer {
            file: file.map(str::to_owned),
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            pre: Token::sentinel(),
            cur: Token::sentinel(),
            interp_parens: None,
        };
        lexer.cur = lexer.scan_token()?;
        Ok(lexer)
    }

    /// Avance d'un token : `pre <- cur`, `cur <-` suivant.
    pub fn next(&mut self) -> Result<(), CompileError> {
        let tok = self.scan_token()?;
        self.pre = std::mem::replace(&mut self.cur, tok);
        Ok(())
    }

    /// Avance si le token courant est `kind`.
    pub fn match_tok(&mut self, kind: &TokenKind) -> Result<bool, CompileError> {
        if &self.cur.kind == kind {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Avance si le token courant est `kind`, erreur de compilation sinon.
    pub fn expect(&mut self, kind: &TokenKind, msg: &str) -> Result<(), CompileError> {
        if self.match_tok(kind)? {
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    /// Erreur localisée sur le token courant.
    pub fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::new(self.file.as_deref(), self.cur.line, msg)
    }

    /// Erreur localisée sur le token consommé.
    pub fn error_at_pre(&self, msg: impl Into<String>) -> CompileError {
        CompileError::new(self.file.as_deref(), self.pre.line, msg)
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /* ───────────────────────── balayage ───────────────────────── */

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn bump_if(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn make(&self, kind: TokenKind, lexeme: impl Into<String>, line: u32) -> Token {
        Token { kind, lexeme: lexeme.into(), line, literal: None }
    }

    fn scan_token(&mut self) -> Result<Token, CompileError> {
        self.skip_trivia()?;
        let line = self.line;
        let Some(c) = self.bump() else {
            return Ok(self.make(TokenKind::Eof, "", line));
        };

        use TokenKind::*;
        let tok = match c {
            ',' => self.make(Comma, ",", line),
            ':' => self.make(Colon, ":", line),
            '(' => {
                if let Some(depth) = self.interp_parens {
                    if depth >= MAX_INTERPOLATION_PARENS {
                        return Err(CompileError::new(
                            self.file.as_deref(),
                            line,
                            "too many unmatched '(' in an interpolation expression",
                        ));
                    }
                    self.interp_parens = Some(depth + 1);
                }
                self.make(LeftParen, "(", line)
            }
            ')' => match self.interp_parens {
                // Parenthèse d'équilibre : la chaîne interrompue reprend ici.
                Some(0) => {
                    self.interp_parens = None;
                    return self.scan_string();
                }
                Some(depth) => {
                    self.interp_parens = Some(depth - 1);
                    self.make(RightParen, ")", line)
                }
                None => self.make(RightParen, ")", line),
            },
            '[' => self.make(LeftBracket, "[", line),
            ']' => self.make(RightBracket, "]", line),
            '{' => self.make(LeftBrace, "{", line),
            '}' => self.make(RightBrace, "}", line),
            '.' => {
                if self.bump_if('.') {
                    self.make(DotDot, "..", line)
                } else {
                    self.make(Dot, ".", line)
                }
            }
            '=' => {
                if self.bump_if('=') {
                    self.make(Eq, "==", line)
                } else {
                    self.make(Assign, "=", line)
                }
            }
            '!' => {
                if self.bump_if('=') {
                    self.make(NotEq, "!=", line)
                } else {
                    self.make(LogicNot, "!", line)
                }
            }
            '>' => {
                if self.bump_if('>') {
                    self.make(ShiftRight, ">>", line)
                } else if self.bump_if('=') {
                    self.make(Ge, ">=", line)
                } else {
                    self.make(Gt, ">", line)
                }
            }
            '<' => {
                if self.bump_if('<') {
                    self.make(ShiftLeft, "<<", line)
                } else if self.bump_if('=') {
                    self.make(Le, "<=", line)
                } else {
                    self.make(Lt, "<", line)
                }
            }
            '&' => {
                if self.bump_if('&') {
                    self.make(LogicAnd, "&&", line)
                } else {
                    self.make(BitAnd, "&", line)
                }
            }
            '|' => {
                if self.bump_if('|') {
                    self.make(LogicOr, "||", line)
                } else {
                    self.make(BitOr, "|", line)
                }
            }
            '~' => self.make(BitNot, "~", line),
            '?' => self.make(Question, "?", line),
            '+' => self.make(Add, "+", line),
            '-' => self.make(Sub, "-", line),
            '*' => self.make(Mul, "*", line),
            '/' => self.make(Div, "/", line),
            '%' => self.make(Mod, "%", line),
            '"' => return self.scan_string_body(line),
            c if c.is_ascii_digit() => return self.scan_number(c, line),
            c if c.is_ascii_alphabetic() || c == '_' => return self.scan_id(c, line),
            other => {
                return Err(CompileError::new(
                    self.file.as_deref(),
                    line,
                    format!("unexpected character {other:?}"),
                ))
            }
        };
        Ok(tok)
    }

    /// Blancs et commentaires. `/* … */` sans imbrication.
    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_next() == Some('*') => {
                    let start_line = self.line;
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(CompileError::new(
                                    self.file.as_deref(),
                                    start_line,
                                    "unterminated block comment",
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_number(&mut self, first: char, line: u32) -> Result<Token, CompileError> {
        let mut text = String::new();
        text.push(first);

        // Hexadécimal
        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    digits.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(CompileError::new(self.file.as_deref(), line, "expect hex digits after 0x"));
            }
            let value = i64::from_str_radix(&digits, 16)
                .map_err(|_| CompileError::new(self.file.as_deref(), line, "hex literal overflows"))?;
            let mut tok = self.make(TokenKind::Num, format!("0x{digits}"), line);
            tok.literal = Some(Literal::Num(value as f64));
            return Ok(tok);
        }

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // Partie fractionnaire : un '.' suivi d'un chiffre (laisse `1..2` au range).
        if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        // Exposant
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut exp = String::from("e");
            let save = self.pos;
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                exp.push(self.bump().expect("sign peeked"));
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        exp.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                text.push_str(&exp);
            } else {
                self.pos = save;
            }
        }

        let value: f64 = text
            .parse()
            .map_err(|_| CompileError::new(self.file.as_deref(), line, "malformed number literal"))?;
        let mut tok = self.make(TokenKind::Num, text, line);
        tok.literal = Some(Literal::Num(value));
        Ok(tok)
    }

    fn scan_id(&mut self, first: char, line: u32) -> Result<Token, CompileError> {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Id);
        Ok(self.make(kind, text, line))
    }

    /// Reprise de chaîne après une parenthèse d'équilibre.
    fn scan_string(&mut self) -> Result<Token, CompileError> {
        let line = self.line;
        self.scan_string_body(line)
    }

    /// Corps de chaîne, guillemet ouvrant déjà consommé (ou reprise après
    /// interpolation). Rend `Str` en fin de chaîne, `Interpolation` devant
    /// une expression intégrée.
    fn scan_string_body(&mut self, line: u32) -> Result<Token, CompileError> {
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(CompileError::new(self.file.as_deref(), line, "unterminated string"));
            };
            match c {
                '"' => {
                    let mut tok = self.make(TokenKind::Str, "", line);
                    tok.literal = Some(Literal::Str(out));
                    return Ok(tok);
                }
                '%' => {
                    if !self.bump_if('(') {
                        return Err(CompileError::new(
                            self.file.as_deref(),
                            self.line,
                            "'%' in a string should be followed by '('",
                        ));
                    }
                    if self.interp_parens.is_some() {
                        return Err(CompileError::new(
                            self.file.as_deref(),
                            self.line,
                            "interpolation can't nest",
                        ));
                    }
                    self.interp_parens = Some(0);
                    let mut tok = self.make(TokenKind::Interpolation, "", line);
                    tok.literal = Some(Literal::Str(out));
                    return Ok(tok);
                }
                '\\' => self.scan_escape(&mut out)?,
                c => out.push(c),
            }
        }
    }

    fn scan_escape(&mut self, out: &mut String) -> Result<(), CompileError> {
        let Some(c) = self.bump() else {
            return Err(CompileError::new(self.file.as_deref(), self.line, "unterminated escape"));
        };
        match c {
            '0' => out.push('\0'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0C'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            '%' => out.push('%'),
            'u' => {
                // Quatre chiffres hexadécimaux, encodés en UTF-8.
                let mut cp: u32 = 0;
                for _ in 0..4 {
                    let d = self.bump().and_then(|c| c.to_digit(16)).ok_or_else(|| {
                        CompileError::new(self.file.as_deref(), self.line, "expect 4 hex digits after \\u")
                    })?;
                    cp = cp * 16 + d;
                }
                let mut buf = [0u8; 4];
                let n = utf8::encode_utf8(cp, &mut buf);
                let encoded = std::str::from_utf8(&buf[..n]).map_err(|_| {
                    CompileError::new(self.file.as_deref(), self.line, "\\u code point is not valid in a string")
                })?;
                out.push_str(encoded);
            }
            other => {
                return Err(CompileError::new(
                    self.file.as_deref(),
                    self.line,
                    format!("unsupported escape \\{other}"),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all_tokens(src: &str) -> Vec<(TokenKind, String, u32)> {
        let mut lx = Lexer::new(None, src).unwrap();
        let mut out = Vec::new();
        loop {
            let t = lx.cur.clone();
            let done = t.kind == TokenKind::Eof;
            out.push((t.kind, t.lexeme, t.line));
            if done {
                break;
            }
            lx.next().unwrap();
        }
        out
    }

    // `var a = 1 + 2` → VAR, ID, ASSIGN, NUM, ADD, NUM, EOF sur la ligne 1.
    #[test]
    fn var_declaration_token_stream() {
        use TokenKind::*;
        let toks = all_tokens("var a = 1 + 2");
        let kinds: Vec<TokenKind> = toks.iter().map(|t| t.0.clone()).collect();
        assert_eq!(kinds, vec![Var, Id, Assign, Num, Add, Num, Eof]);
        assert!(toks.iter().all(|t| t.2 <= 1));
        assert_eq!(toks[1].1, "a");
    }

    #[test]
    fn number_literals() {
        let mut lx = Lexer::new(None, "3.25 0x1f 2e3 7").unwrap();
        let mut nums = Vec::new();
        while lx.cur.kind != TokenKind::Eof {
            match &lx.cur.literal {
                Some(Literal::Num(n)) => nums.push(*n),
                other => panic!("expected number literal, got {other:?}"),
            }
            lx.next().unwrap();
        }
        assert_eq!(nums, vec![3.25, 31.0, 2000.0, 7.0]);
    }

    #[test]
    fn dotdot_does_not_eat_a_float() {
        use TokenKind::*;
        let kinds: Vec<TokenKind> = all_tokens("1..4").iter().map(|t| t.0.clone()).collect();
        assert_eq!(kinds, vec![Num, DotDot, Num, Eof]);
    }

    #[test]
    fn comments_are_trivia() {
        use TokenKind::*;
        let kinds: Vec<TokenKind> =
            all_tokens("a // ligne\n/* bloc\nsur deux lignes */ b")
                .iter()
                .map(|t| t.0.clone())
                .collect();
        assert_eq!(kinds, vec![Id, Id, Eof]);
    }

    #[test]
    fn unterminated_block_comment_is_fatal() {
        assert!(Lexer::new(None, "/* jamais fermé").is_err());
    }

    #[test]
    fn string_escapes() {
        let mut lx = Lexer::new(None, r#""a\n\tA\%""#).unwrap();
        match &lx.cur.literal {
            Some(Literal::Str(s)) => assert_eq!(s, "a\n\tA%"),
            other => panic!("{other:?}"),
        }
        lx.next().unwrap();
        assert_eq!(lx.cur.kind, TokenKind::Eof);
    }

    // "a %(x + 1) b" → Interpolation("a "), ID, ADD, NUM, Str(" b").
    #[test]
    fn interpolation_splits_the_string() {
        use TokenKind::*;
        let toks = all_tokens(r#""a %(x + 1) b""#);
        let kinds: Vec<TokenKind> = toks.iter().map(|t| t.0.clone()).collect();
        assert_eq!(kinds, vec![Interpolation, Id, Add, Num, Str, Eof]);
    }

    // Les parenthèses internes de l'expression intégrée sont équilibrées.
    #[test]
    fn interpolation_tracks_inner_parens() {
        use TokenKind::*;
        let kinds: Vec<TokenKind> = all_tokens(r#""v: %((a) * (b))""#)
            .iter()
            .map(|t| t.0.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                Interpolation, LeftParen, Id, RightParen, Mul, LeftParen, Id, RightParen, Str, Eof
            ]
        );
    }

    // Huit parenthèses en attente passent, la neuvième est une erreur.
    #[test]
    fn interpolation_paren_depth_is_bounded() {
        let deep_ok = format!("\"v: %({}x{})\"", "(".repeat(8), ")".repeat(8));
        let mut lx = Lexer::new(None, &deep_ok).unwrap();
        while lx.cur.kind != TokenKind::Eof {
            lx.next().unwrap();
        }

        let too_deep = format!("\"v: %({}x{})\"", "(".repeat(9), ")".repeat(9));
        let mut lx = Lexer::new(None, &too_deep).unwrap();
        let mut err = None;
        for _ in 0..16 {
            if let Err(e) = lx.next() {
                err = Some(e);
                break;
            }
        }
        assert!(err.unwrap().msg.contains("too many unmatched '('"));
    }

    #[test]
    fn nested_interpolation_is_rejected() {
        let mut lx = Lexer::new(None, r#""a %("b %(c)")""#).unwrap();
        let mut err = None;
        for _ in 0..8 {
            if let Err(e) = lx.next() {
                err = Some(e);
                break;
            }
        }
        assert!(err.unwrap().msg.contains("nest"));
    }

    #[test]
    fn keywords_are_not_identifiers() {
        use TokenKind::*;
        let kinds: Vec<TokenKind> = all_tokens("class static superb super")
            .iter()
            .map(|t| t.0.clone())
            .collect();
        assert_eq!(kinds, vec![Class, Static, Id, Super, Eof]);
    }
}
