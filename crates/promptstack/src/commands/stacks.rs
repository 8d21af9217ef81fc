//! `promptstack stacks`.

use promptstack_core::StackCatalog;

pub fn list_stacks() {
    let catalog = StackCatalog::builtin();
    println!("Available stacks:");
    println!();
    for stack in catalog.all() {
        println!("  {:<16} {}", stack.id, stack.title);
        println!("  {:<16} {}", "", stack.description);
        println!("  {:<16} image {} (hash {})", "", stack.image, stack.content_hash());
        println!();
    }
}
