pub mod cc;
pub mod error;
pub mod sim;

#[cfg(test)]
mod test;
