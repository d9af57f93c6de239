use super::token;

#[derive(Clone, Copy)]
pub enum Associativity {
    Left,
    Right,
}

// Rows are indexed by `usize::from(TokenType)` and hold the (prefix, infix,
// postfix, associativity) binding powers of that token. Lower numbers bind
// tighter.
pub const OPERATORS: [(Option<u8>, Option<u8>, Option<u8>, Option<Associativity>); token::NUMBER] = [
    (None, None, Some(1), None),                          // 0  OParen
    (None, None, None, None),                             // 1  CParen
    (None, None, None, None),                             // 2  OBrace
    (None, None, None, None),                             // 3  CBrace
    (None, None, None, None),                             // 4  Comma
    (None, None, Some(1), None),                          // 5  Period
    (None, None, None, None),                             // 6  Semicolon
    (None, Some(5), None, Some(Associativity::Left)),     // 7  Plus
    (Some(2), Some(5), None, Some(Associativity::Left)),  // 8  Minus
    (None, Some(4), None, Some(Associativity::Left)),     // 9  Star
    (None, Some(4), None, Some(Associativity::Left)),     // 10 Slash
    (None, Some(4), None, Some(Associativity::Left)),     // 11 Percent
    (None, Some(3), None, Some(Associativity::Right)),    // 12 Power
    (None, Some(6), None, Some(Associativity::Left)),     // 13 ShiftLeft
    (None, Some(6), None, Some(Associativity::Left)),     // 14 ShiftRight
    (None, Some(11), None, Some(Associativity::Right)),   // 15 Equal
    (None, Some(11), None, Some(Associativity::Right)),   // 16 PlusEqual
    (None, Some(11), None, Some(Associativity::Right)),   // 17 MinusEqual
    (None, Some(11), None, Some(Associativity::Right)),   // 18 StarEqual
    (None, Some(11), None, Some(Associativity::Right)),   // 19 SlashEqual
    (None, Some(11), None, Some(Associativity::Right)),   // 20 PercentEqual
    (None, Some(11), None, Some(Associativity::Right)),   // 21 PowerEqual
    (None, None, Some(1), None),                          // 22 DPlus
    (None, None, Some(1), None),                          // 23 DMinus
    (None, Some(8), None, Some(Associativity::Left)),     // 24 DEqual
    (Some(2), None, None, None),                          // 25 Bang
    (None, Some(8), None, Some(Associativity::Left)),     // 26 BangEqual
    (None, Some(7), None, Some(Associativity::Left)),     // 27 Greater
    (None, Some(7), None, Some(Associativity::Left)),     // 28 GreaterEqual
    (None, Some(7), None, Some(Associativity::Left)),     // 29 Less
    (None, Some(7), None, Some(Associativity::Left)),     // 30 LessEqual
    (None, None, None, None),                             // 31 String
    (None, None, None, None),                             // 32 UnTermedString
    (None, None, None, None),                             // 33 Comment
    (None, None, None, None),                             // 34 Identifier
    (None, None, None, None),                             // 35 Number
    (None, None, None, None),                             // 36 InvalidNumber
    (None, Some(9), None, Some(Associativity::Left)),     // 37 And
    (None, None, None, None),                             // 38 Class
    (None, None, None, None),                             // 39 Const
    (None, None, None, None),                             // 40 Else
    (None, None, None, None),                             // 41 Exit
    (None, None, None, None),                             // 42 False
    (None, None, None, None),                             // 43 For
    (None, None, None, None),                             // 44 Fun
    (None, None, None, None),                             // 45 If
    (None, None, None, None),                             // 46 Nil
    (None, Some(10), None, Some(Associativity::Left)),    // 47 Or
    (None, None, None, None),                             // 48 Print
    (None, None, None, None),                             // 49 Return
    (None, None, None, None),                             // 50 Super
    (None, None, None, None),                             // 51 This
    (None, None, None, None),                             // 52 True
    (None, None, None, None),                             // 53 Var
    (None, None, None, None),                             // 54 While
    (None, None, None, None),                             // 55 Unknown
    (None, None, None, None),                             // 56 EOF
];
