mod console;

pub use console::Console;
