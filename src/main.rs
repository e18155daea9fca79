#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    let _rocket = concord::rocket().launch().await?;
    Ok(())
}
