mod dead_letter;
mod migration;
mod sync;
mod tantivy;

#[ctor::ctor]
fn init() {
    colog::init();
}
