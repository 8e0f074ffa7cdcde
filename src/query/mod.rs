pub mod ast;
pub mod compiler;
pub mod executor;
pub mod lexer;
pub mod parser;
