mod ask;
mod cli;
