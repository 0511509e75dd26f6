//! Statement shape normalization.

/// Reduce a statement to its shape: single-quoted string literals and
/// numeric literals become `?`, whitespace runs collapse to one space.
///
/// Case is preserved. Digits that continue an identifier (`table1`) are
/// not literals. A doubled quote inside a string (`'it''s'`) is an escape,
/// not the end of the literal.
pub fn normalize_shape(sql: &str) -> String {
    let mut shape = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;
    let mut prev: Option<char> = None;

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            pending_space = !shape.is_empty();
            continue;
        }
        if pending_space {
            shape.push(' ');
            pending_space = false;
        }

        if c == '\'' {
            while let Some(inner) = chars.next() {
                if inner == '\'' {
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        continue;
                    }
                    break;
                }
            }
            shape.push('?');
            prev = Some('?');
            continue;
        }

        let continues_identifier = prev.is_some_and(|p| p.is_alphanumeric() || p == '_');
        if c.is_ascii_digit() && !continues_identifier {
            while let Some(next) = chars.peek() {
                if next.is_ascii_digit() || *next == '.' {
                    chars.next();
                } else {
                    break;
                }
            }
            shape.push('?');
            prev = Some('?');
            continue;
        }

        shape.push(c);
        prev = Some(c);
    }

    shape
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_and_strings_become_placeholders() {
        assert_eq!(
            normalize_shape("SELECT * FROM users WHERE id = 42 AND name = 'bob'"),
            "SELECT * FROM users WHERE id = ? AND name = ?"
        );
    }

    #[test]
    fn different_parameters_share_a_shape() {
        let a = normalize_shape("SELECT * FROM orders WHERE total > 10.5 LIMIT 10");
        let b = normalize_shape("SELECT * FROM orders WHERE total > 99 LIMIT 50");
        assert_eq!(a, b);
    }

    #[test]
    fn escaped_quotes_stay_inside_literal() {
        assert_eq!(
            normalize_shape("SELECT 1 FROM t WHERE note = 'it''s 5 o''clock'"),
            "SELECT ? FROM t WHERE note = ?"
        );
    }

    #[test]
    fn digits_in_identifiers_are_kept() {
        assert_eq!(
            normalize_shape("SELECT col_2 FROM table1 WHERE x = 3"),
            "SELECT col_2 FROM table1 WHERE x = ?"
        );
    }

    #[test]
    fn whitespace_is_collapsed_and_case_kept() {
        assert_eq!(
            normalize_shape("  select *\n\tFROM   Users  "),
            "select * FROM Users"
        );
    }

    #[test]
    fn lists_of_literals() {
        assert_eq!(
            normalize_shape("SELECT * FROM t WHERE id IN (1,2,3)"),
            "SELECT * FROM t WHERE id IN (?,?,?)"
        );
    }

    #[test]
    fn unterminated_string_is_one_literal() {
        assert_eq!(normalize_shape("SELECT 'oops"), "SELECT ?");
    }

    #[test]
    fn numbered_placeholders_lose_their_index() {
        assert_eq!(
            normalize_shape("SELECT * FROM t WHERE id = $1"),
            "SELECT * FROM t WHERE id = $?"
        );
    }
}
