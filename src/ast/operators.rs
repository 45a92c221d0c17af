/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Comparison
    /// Equal (`==`)
    Equal,
    /// Not equal (`!=`)
    NotEqual,
    /// Less than (`<`)
    LessThan,
    /// Greater than (`>`)
    GreaterThan,
    /// Less than or equal (`<=`)
    LessEqual,
    /// Greater than or equal (`>=`)
    GreaterEqual,

    // Arithmetic
    /// Addition or string concatenation (`+`)
    Add,
    /// Subtraction (`-`)
    Subtract,
    /// Multiplication (`*`)
    Multiply,
    /// Division (`/`)
    Divide,
    /// Modulo (`%`)
    Modulo,

    // Logical
    /// Short-circuit AND (`&&`)
    AndAlso,
    /// Short-circuit OR (`||`)
    OrElse,

    // Null-coalescing
    /// Null-coalescing (`??`)
    Coalesce,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Equal => "==",
            BinOp::NotEqual => "!=",
            BinOp::LessThan => "<",
            BinOp::GreaterThan => ">",
            BinOp::LessEqual => "<=",
            BinOp::GreaterEqual => ">=",
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::Modulo => "%",
            BinOp::AndAlso => "&&",
            BinOp::OrElse => "||",
            BinOp::Coalesce => "??",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Equal
                | BinOp::NotEqual
                | BinOp::LessThan
                | BinOp::GreaterThan
                | BinOp::LessEqual
                | BinOp::GreaterEqual
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Modulo
        )
    }

    /// The comparison obtained by swapping operands (`a < b` is `b > a`).
    pub fn reversed(self) -> BinOp {
        match self {
            BinOp::LessThan => BinOp::GreaterThan,
            BinOp::GreaterThan => BinOp::LessThan,
            BinOp::LessEqual => BinOp::GreaterEqual,
            BinOp::GreaterEqual => BinOp::LessEqual,
            other => other,
        }
    }

    /// Binding strength used when printing expressions.
    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinOp::Coalesce => 1,
            BinOp::OrElse => 2,
            BinOp::AndAlso => 3,
            BinOp::Equal | BinOp::NotEqual => 4,
            BinOp::LessThan | BinOp::GreaterThan | BinOp::LessEqual | BinOp::GreaterEqual => 5,
            BinOp::Add | BinOp::Subtract => 6,
            BinOp::Multiply | BinOp::Divide | BinOp::Modulo => 7,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation (`!`)
    Not,
    /// Arithmetic negation (`-`)
    Negate,
}
