pub fn init() {
    println!(
        r#"
 _  _____ ___  ____
| |/ /_ _/ _ \/ ___|
| ' / | | | | \___ \
| . \ | | |_| |___) |
|_|\_\|_|\___/|____/
"#
    );
}
